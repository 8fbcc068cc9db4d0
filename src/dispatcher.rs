//! 변경 이벤트 디스패치
//!
//! 디스패처 호출은 이벤트가 안전하게 넘겨질 때까지 대기하므로,
//! 전달 스레드에 자연스럽게 backpressure가 걸립니다.

use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, TableId, TransactionInfo};
use crate::offset::{OffsetContext, Partition, SourceInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// 하위 이벤트 파이프라인
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn dispatch_transaction_started_event(
        &self,
        partition: &Partition,
        transaction: &TransactionInfo,
        offset: &OffsetContext,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    async fn dispatch_transaction_committed_event(
        &self,
        partition: &Partition,
        offset: &OffsetContext,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    async fn dispatch_data_change_event(
        &self,
        partition: &Partition,
        table_id: &TableId,
        record: ChangeRecord,
    ) -> Result<()>;
}

/// 디스패치된 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchedEvent {
    TransactionStarted {
        partition: Partition,
        transaction: TransactionInfo,
        source: SourceInfo,
        timestamp: DateTime<Utc>,
    },
    TransactionCommitted {
        partition: Partition,
        transaction_id: Option<String>,
        event_count: u64,
        source: SourceInfo,
        timestamp: DateTime<Utc>,
    },
    DataChange {
        partition: Partition,
        table_id: TableId,
        record: ChangeRecord,
    },
}

impl DispatchedEvent {
    /// 이벤트에 찍힌 소스 위치
    pub fn source(&self) -> &SourceInfo {
        match self {
            DispatchedEvent::TransactionStarted { source, .. }
            | DispatchedEvent::TransactionCommitted { source, .. } => source,
            DispatchedEvent::DataChange { record, .. } => &record.source,
        }
    }
}

/// 디스패치 이벤트 수신자
pub type DispatchedEventReceiver = mpsc::Receiver<DispatchedEvent>;

/// 제한된 채널로 이벤트를 넘기는 디스패처
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::Sender<DispatchedEvent>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, DispatchedEventReceiver) {
        let (sender, receiver) = mpsc::channel(capacity);
        (ChannelDispatcher { sender }, receiver)
    }

    async fn send(&self, event: DispatchedEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| CdcError::ChannelClosed)
    }
}

#[async_trait]
impl EventDispatcher for ChannelDispatcher {
    async fn dispatch_transaction_started_event(
        &self,
        partition: &Partition,
        transaction: &TransactionInfo,
        offset: &OffsetContext,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        debug!(
            "Dispatching transaction start {} on shard {}",
            transaction.transaction_id, transaction.shard
        );
        self.send(DispatchedEvent::TransactionStarted {
            partition: partition.clone(),
            transaction: transaction.clone(),
            source: offset.source_info().clone(),
            timestamp,
        })
        .await
    }

    async fn dispatch_transaction_committed_event(
        &self,
        partition: &Partition,
        offset: &OffsetContext,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let transaction = offset.transaction();
        debug!(
            "Dispatching transaction commit {:?} ({} events)",
            transaction.transaction_id(),
            transaction.total_order()
        );
        self.send(DispatchedEvent::TransactionCommitted {
            partition: partition.clone(),
            transaction_id: transaction.transaction_id().map(String::from),
            event_count: transaction.total_order(),
            source: offset.source_info().clone(),
            timestamp,
        })
        .await
    }

    async fn dispatch_data_change_event(
        &self,
        partition: &Partition,
        table_id: &TableId,
        record: ChangeRecord,
    ) -> Result<()> {
        self.send(DispatchedEvent::DataChange {
            partition: partition.clone(),
            table_id: table_id.clone(),
            record,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::events::{CellValue, Column, RowChange};
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_channel_dispatcher_delivers_in_order() {
        let (dispatcher, mut rx) = ChannelDispatcher::new(8);
        let partition = Partition::new("test-server");
        let mut offset = OffsetContext::initial(&ConnectorConfig::default());
        let table = TableId::new("commerce", "orders");

        let info = TransactionInfo {
            transaction_id: "tx-1".to_string(),
            shard: "-80".to_string(),
            order: None,
        };
        offset.begin_transaction(Some("tx-1".to_string()), None);
        assert_ok!(
            dispatcher
                .dispatch_transaction_started_event(&partition, &info, &offset, Utc::now())
                .await
        );

        offset.event(&table, Utc::now());
        let record = ChangeRecord::new(
            table.clone(),
            RowChange::insert("commerce.orders", vec![Column::new("id", CellValue::Int64(1))]),
            offset.source_info_for_dispatch(),
            offset.transaction_block(&table),
        );
        assert_ok!(dispatcher.dispatch_data_change_event(&partition, &table, record).await);
        assert_ok!(
            dispatcher
                .dispatch_transaction_committed_event(&partition, &offset, Utc::now())
                .await
        );

        assert!(matches!(
            rx.recv().await,
            Some(DispatchedEvent::TransactionStarted { .. })
        ));
        match rx.recv().await {
            Some(DispatchedEvent::DataChange { record, .. }) => {
                assert_eq!(record.transaction.unwrap().total_order, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await {
            Some(DispatchedEvent::TransactionCommitted { event_count, .. }) => {
                assert_eq!(event_count, 1)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_is_an_error() {
        let (dispatcher, rx) = ChannelDispatcher::new(1);
        drop(rx);
        let offset = OffsetContext::initial(&ConnectorConfig::default());
        let result = dispatcher
            .dispatch_transaction_committed_event(&Partition::new("s"), &offset, Utc::now())
            .await;
        assert_err!(&result);
        assert!(matches!(result, Err(CdcError::ChannelClosed)));
    }

    #[test]
    fn test_dispatched_event_json_tag() {
        let offset = OffsetContext::initial(&ConnectorConfig::default());
        let event = DispatchedEvent::TransactionCommitted {
            partition: Partition::new("s"),
            transaction_id: None,
            event_count: 0,
            source: offset.source_info().clone(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "transaction_committed");
    }
}
