use std::{
    collections::HashMap,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tracing::debug;
use rusoto_core::RusotoError;
use rusoto_dynamodb::{
    AttributeValue, DeleteItemError, DeleteItemInput, DynamoDb, DynamoDbClient, GetItemInput,
    PutItemError, PutItemInput, QueryInput, UpdateItemError, UpdateItemInput,
};

use crate::{error::StoreError, queue::WaitTicket};

use super::{LeaseStore, StoreResult};

const LEASE_KEY: &str = "lease_key";
const LEASE_OWNER: &str = "lease_owner";
const EXPIRES_AT: &str = "expires_at";
const EXPIRES_AT_SECS: &str = "expires_at_secs";
const NEXT_SEQUENCE: &str = "next_sequence";
const LOCK_KEY: &str = "lock_key";
const SEQUENCE: &str = "sequence";
const HOLDER_ID: &str = "holder_id";
const ENQUEUED_AT: &str = "enqueued_at";

/// Sort key of the per-lock counter item in the queue table. Tickets start at 1.
const COUNTER_SEQUENCE: u64 = 0;

type Item = HashMap<String, AttributeValue>;

/// [`LeaseStore`] on two DynamoDB tables.
///
/// * lease table, partition key `lease_key` (S): one item per lock with
///   `lease_owner` and `expires_at` (epoch millis).
/// * queue table, partition key `lock_key` (S), sort key `sequence` (N):
///   one item per ticket, plus the ticket counter at sequence `0`.
///
/// Leases and tickets also carry `expires_at_secs` (epoch seconds); point
/// DynamoDB's TTL setting at it on both tables to sweep items left by crashed
/// processes. Readers never trust it, since TTL deletion lags by hours.
/// `queue_head` deletes the expired tickets it walks past.
///
/// Every mutation is a conditional write, so the table is the only arbiter of
/// ownership. Expiry compares wall clocks, so hosts need reasonably synced
/// time. There is no push channel; waiters poll.
pub struct DynamoLeaseStore {
    dynamo_client: DynamoDbClient,
    lease_table: String,
    queue_table: String,
}

impl DynamoLeaseStore {
    pub fn new(
        dynamo_client: DynamoDbClient,
        lease_table: impl Into<String>,
        queue_table: impl Into<String>,
    ) -> Self {
        Self {
            dynamo_client,
            lease_table: lease_table.into(),
            queue_table: queue_table.into(),
        }
    }

    fn lease_item_key(key: &str) -> Item {
        let mut item = Item::new();
        item.insert(LEASE_KEY.to_owned(), string(key));
        item
    }

    fn ticket_item_key(key: &str, sequence: u64) -> Item {
        let mut item = Item::new();
        item.insert(LOCK_KEY.to_owned(), string(key));
        item.insert(SEQUENCE.to_owned(), number(sequence));
        item
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        let input = UpdateItemInput {
            table_name: self.queue_table.clone(),
            key: Self::ticket_item_key(key, COUNTER_SEQUENCE),
            update_expression: Some(format!("ADD {} :one", NEXT_SEQUENCE)),
            expression_attribute_values: Some(values(vec![(":one", number(1))])),
            return_values: Some("UPDATED_NEW".to_owned()),
            ..Default::default()
        };

        let output = self
            .dynamo_client
            .update_item(input)
            .await
            .map_err(|error| store_error("enqueue", error))?;

        output
            .attributes
            .as_ref()
            .and_then(|attributes| read_number(attributes, NEXT_SEQUENCE))
            .ok_or_else(|| StoreError::Rejected("enqueue: counter update returned no value".to_owned()))
    }

    /// Deletes a ticket only if it is still expired, so a ticket touched in
    /// the meantime survives.
    async fn sweep_ticket(&self, key: &str, sequence: u64, now: u64) -> StoreResult<()> {
        let input = DeleteItemInput {
            table_name: self.queue_table.clone(),
            key: Self::ticket_item_key(key, sequence),
            condition_expression: Some(format!("{} < :now", EXPIRES_AT)),
            expression_attribute_values: Some(values(vec![(":now", number(now))])),
            ..Default::default()
        };

        match self.dynamo_client.delete_item(input).await {
            Ok(_) => {
                debug!(key, sequence, "swept expired wait ticket");
                Ok(())
            }
            Err(RusotoError::Service(DeleteItemError::ConditionalCheckFailed(_))) => Ok(()),
            Err(error) => Err(store_error("queue_head", error)),
        }
    }
}

#[async_trait]
impl LeaseStore for DynamoLeaseStore {
    async fn try_acquire(&self, key: &str, holder_id: &str, ttl: Duration) -> StoreResult<bool> {
        let now = now_millis();
        let mut item = Self::lease_item_key(key);
        item.insert(LEASE_OWNER.to_owned(), string(holder_id));
        expiry(&mut item, now + millis(ttl));

        let input = PutItemInput {
            table_name: self.lease_table.clone(),
            item,
            condition_expression: Some(format!(
                "attribute_not_exists({}) OR {} < :now OR {} = :owner",
                LEASE_KEY, EXPIRES_AT, LEASE_OWNER
            )),
            expression_attribute_values: Some(values(vec![
                (":now", number(now)),
                (":owner", string(holder_id)),
            ])),
            ..Default::default()
        };

        match self.dynamo_client.put_item(input).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(PutItemError::ConditionalCheckFailed(_))) => Ok(false),
            Err(error) => Err(store_error("try_acquire", error)),
        }
    }

    async fn renew(&self, key: &str, holder_id: &str, ttl: Duration) -> StoreResult<bool> {
        let now = now_millis();
        let input = UpdateItemInput {
            table_name: self.lease_table.clone(),
            key: Self::lease_item_key(key),
            update_expression: Some(format!(
                "SET {} = :expires, {} = :expires_secs",
                EXPIRES_AT, EXPIRES_AT_SECS
            )),
            condition_expression: Some(format!(
                "{} = :owner AND {} >= :now",
                LEASE_OWNER, EXPIRES_AT
            )),
            expression_attribute_values: Some(values(vec![
                (":expires", number(now + millis(ttl))),
                (":expires_secs", number(epoch_secs(now + millis(ttl)))),
                (":owner", string(holder_id)),
                (":now", number(now)),
            ])),
            ..Default::default()
        };

        match self.dynamo_client.update_item(input).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(UpdateItemError::ConditionalCheckFailed(_))) => Ok(false),
            Err(error) => Err(store_error("renew", error)),
        }
    }

    async fn release(&self, key: &str, holder_id: &str) -> StoreResult<bool> {
        let input = DeleteItemInput {
            table_name: self.lease_table.clone(),
            key: Self::lease_item_key(key),
            condition_expression: Some(format!("{} = :owner", LEASE_OWNER)),
            expression_attribute_values: Some(values(vec![(":owner", string(holder_id))])),
            ..Default::default()
        };

        match self.dynamo_client.delete_item(input).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(DeleteItemError::ConditionalCheckFailed(_))) => Ok(false),
            Err(error) => Err(store_error("release", error)),
        }
    }

    async fn current_holder(&self, key: &str) -> StoreResult<Option<String>> {
        let input = GetItemInput {
            table_name: self.lease_table.clone(),
            key: Self::lease_item_key(key),
            consistent_read: Some(true),
            ..Default::default()
        };

        let output = self
            .dynamo_client
            .get_item(input)
            .await
            .map_err(|error| store_error("current_holder", error))?;

        Ok(output.item.and_then(|item| live_owner(&item, now_millis())))
    }

    async fn enqueue(
        &self,
        key: &str,
        holder_id: &str,
        ticket_ttl: Duration,
    ) -> StoreResult<WaitTicket> {
        let sequence = self.next_sequence(key).await?;
        let now = now_millis();
        let ticket = WaitTicket {
            key: key.to_owned(),
            holder_id: holder_id.to_owned(),
            enqueued_at: UNIX_EPOCH + Duration::from_millis(now),
            sequence,
        };

        let mut item = Self::ticket_item_key(key, sequence);
        item.insert(HOLDER_ID.to_owned(), string(holder_id));
        item.insert(ENQUEUED_AT.to_owned(), number(now));
        expiry(&mut item, now + millis(ticket_ttl));

        let input = PutItemInput {
            table_name: self.queue_table.clone(),
            item,
            ..Default::default()
        };

        self.dynamo_client
            .put_item(input)
            .await
            .map_err(|error| store_error("enqueue", error))?;
        Ok(ticket)
    }

    async fn touch_ticket(&self, ticket: &WaitTicket, ticket_ttl: Duration) -> StoreResult<bool> {
        let now = now_millis();
        let input = UpdateItemInput {
            table_name: self.queue_table.clone(),
            key: Self::ticket_item_key(&ticket.key, ticket.sequence),
            update_expression: Some(format!(
                "SET {} = :expires, {} = :expires_secs",
                EXPIRES_AT, EXPIRES_AT_SECS
            )),
            condition_expression: Some(format!(
                "{} = :holder AND {} >= :now",
                HOLDER_ID, EXPIRES_AT
            )),
            expression_attribute_values: Some(values(vec![
                (":expires", number(now + millis(ticket_ttl))),
                (":expires_secs", number(epoch_secs(now + millis(ticket_ttl)))),
                (":holder", string(&ticket.holder_id)),
                (":now", number(now)),
            ])),
            ..Default::default()
        };

        match self.dynamo_client.update_item(input).await {
            Ok(_) => Ok(true),
            Err(RusotoError::Service(UpdateItemError::ConditionalCheckFailed(_))) => Ok(false),
            Err(error) => Err(store_error("touch_ticket", error)),
        }
    }

    async fn dequeue(&self, ticket: &WaitTicket) -> StoreResult<bool> {
        let input = DeleteItemInput {
            table_name: self.queue_table.clone(),
            key: Self::ticket_item_key(&ticket.key, ticket.sequence),
            return_values: Some("ALL_OLD".to_owned()),
            ..Default::default()
        };

        let output = self
            .dynamo_client
            .delete_item(input)
            .await
            .map_err(|error| store_error("dequeue", error))?;
        Ok(output.attributes.is_some())
    }

    async fn queue_head(&self, key: &str) -> StoreResult<Option<WaitTicket>> {
        let now = now_millis();
        let mut exclusive_start_key = None;

        loop {
            let input = QueryInput {
                table_name: self.queue_table.clone(),
                key_condition_expression: Some(format!("{} = :key AND #sequence > :counter", LOCK_KEY)),
                expression_attribute_names: Some(
                    vec![("#sequence".to_owned(), SEQUENCE.to_owned())]
                        .into_iter()
                        .collect(),
                ),
                expression_attribute_values: Some(values(vec![
                    (":key", string(key)),
                    (":counter", number(COUNTER_SEQUENCE)),
                ])),
                consistent_read: Some(true),
                scan_index_forward: Some(true),
                exclusive_start_key: exclusive_start_key.take(),
                ..Default::default()
            };

            let output = self
                .dynamo_client
                .query(input)
                .await
                .map_err(|error| store_error("queue_head", error))?;

            for item in output.items.unwrap_or_default() {
                if !is_expired(&item, now) {
                    return ticket_from_item(&item).map(Some);
                }
                if let Some(sequence) = read_number(&item, SEQUENCE) {
                    self.sweep_ticket(key, sequence, now).await?;
                }
            }

            match output.last_evaluated_key {
                Some(last) => exclusive_start_key = Some(last),
                None => return Ok(None),
            }
        }
    }
}

fn store_error<E: std::error::Error + 'static>(operation: &str, error: RusotoError<E>) -> StoreError {
    let message = format!("{} failed: {}", operation, error);
    match error {
        RusotoError::Credentials(_) | RusotoError::Validation(_) | RusotoError::ParseError(_) => {
            StoreError::Rejected(message)
        }
        _ => StoreError::Unavailable(message),
    }
}

fn string(value: &str) -> AttributeValue {
    AttributeValue {
        s: Some(value.to_owned()),
        ..Default::default()
    }
}

fn number(value: u64) -> AttributeValue {
    AttributeValue {
        n: Some(value.to_string()),
        ..Default::default()
    }
}

fn values(pairs: Vec<(&str, AttributeValue)>) -> Item {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_owned(), value))
        .collect()
}

fn read_string(item: &Item, name: &str) -> Option<String> {
    item.get(name).and_then(|value| value.s.clone())
}

fn read_number(item: &Item, name: &str) -> Option<u64> {
    item.get(name)
        .and_then(|value| value.n.as_deref())
        .and_then(|value| value.parse().ok())
}

/// Sets the millisecond expiry readers check and the second-granularity
/// copy DynamoDB TTL reads.
fn expiry(item: &mut Item, expires_at: u64) {
    item.insert(EXPIRES_AT.to_owned(), number(expires_at));
    item.insert(EXPIRES_AT_SECS.to_owned(), number(epoch_secs(expires_at)));
}

/// Items without an expiry never expire.
fn is_expired(item: &Item, now: u64) -> bool {
    read_number(item, EXPIRES_AT).map_or(false, |expires_at| expires_at < now)
}

fn live_owner(item: &Item, now: u64) -> Option<String> {
    let expires_at = read_number(item, EXPIRES_AT)?;
    if expires_at < now {
        return None;
    }
    read_string(item, LEASE_OWNER)
}

fn ticket_from_item(item: &Item) -> StoreResult<WaitTicket> {
    let field = |name: &str| StoreError::Rejected(format!("queue item is missing '{}'", name));
    Ok(WaitTicket {
        key: read_string(item, LOCK_KEY).ok_or_else(|| field(LOCK_KEY))?,
        holder_id: read_string(item, HOLDER_ID).ok_or_else(|| field(HOLDER_ID))?,
        enqueued_at: UNIX_EPOCH
            + Duration::from_millis(read_number(item, ENQUEUED_AT).ok_or_else(|| field(ENQUEUED_AT))?),
        sequence: read_number(item, SEQUENCE).ok_or_else(|| field(SEQUENCE))?,
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis)
        .unwrap_or(0)
}

fn epoch_secs(millis: u64) -> u64 {
    (millis + 999) / 1_000
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_item(owner: &str, expires_at: u64) -> Item {
        let mut item = DynamoLeaseStore::lease_item_key("orders");
        item.insert(LEASE_OWNER.to_owned(), string(owner));
        item.insert(EXPIRES_AT.to_owned(), number(expires_at));
        item
    }

    #[test]
    fn owner_is_reported_only_while_lease_is_live() {
        let item = lease_item("node-a:1", 1_000);
        assert_eq!(live_owner(&item, 999).as_deref(), Some("node-a:1"));
        assert_eq!(live_owner(&item, 1_000).as_deref(), Some("node-a:1"));
        assert_eq!(live_owner(&item, 1_001), None);
    }

    #[test]
    fn ticket_round_trips_through_item() {
        let mut item = DynamoLeaseStore::ticket_item_key("orders", 7);
        item.insert(HOLDER_ID.to_owned(), string("node-a:1"));
        item.insert(ENQUEUED_AT.to_owned(), number(1_700_000_000_000));

        let ticket = ticket_from_item(&item).unwrap();
        assert_eq!(ticket.key, "orders");
        assert_eq!(ticket.holder_id, "node-a:1");
        assert_eq!(ticket.sequence, 7);
        assert_eq!(
            ticket.enqueued_at,
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_000)
        );
    }

    #[test]
    fn counter_shares_the_ticket_partition_below_every_ticket() {
        let counter = DynamoLeaseStore::ticket_item_key("orders", COUNTER_SEQUENCE);
        assert_eq!(read_string(&counter, LOCK_KEY).as_deref(), Some("orders"));
        assert_eq!(read_number(&counter, SEQUENCE), Some(0));
        assert!(!counter.contains_key(LEASE_KEY));

        let user_key = DynamoLeaseStore::lease_item_key("orders#sequence");
        assert_eq!(read_string(&user_key, LEASE_KEY).as_deref(), Some("orders#sequence"));
        assert!(!user_key.contains_key(NEXT_SEQUENCE));
    }

    #[test]
    fn expired_tickets_are_told_apart_from_live_ones() {
        let mut item = DynamoLeaseStore::ticket_item_key("orders", 3);
        assert!(!is_expired(&item, u64::MAX));

        expiry(&mut item, 10_500);
        assert!(!is_expired(&item, 10_500));
        assert!(is_expired(&item, 10_501));
        assert_eq!(read_number(&item, EXPIRES_AT_SECS), Some(11));
    }

    #[test]
    fn ttl_attribute_never_precedes_the_lease_expiry() {
        assert_eq!(epoch_secs(0), 0);
        assert_eq!(epoch_secs(1_000), 1);
        assert_eq!(epoch_secs(1_001), 2);
    }

    #[test]
    fn incomplete_ticket_is_rejected() {
        let item = DynamoLeaseStore::ticket_item_key("orders", 7);
        assert_eq!(
            ticket_from_item(&item),
            Err(StoreError::Rejected("queue item is missing 'holder_id'".to_owned()))
        );
    }

    #[test]
    fn transport_failures_are_retryable_and_validation_is_not() {
        let dispatch: RusotoError<PutItemError> =
            RusotoError::HttpDispatch(rusoto_core::request::HttpDispatchError::new("reset".to_owned()));
        assert!(store_error("try_acquire", dispatch).is_retryable());

        let validation: RusotoError<PutItemError> = RusotoError::Validation("bad table".to_owned());
        assert_eq!(
            store_error("try_acquire", validation),
            StoreError::Rejected("try_acquire failed: bad table".to_owned())
        );
    }
}
