/// Vitess CDC 스트리밍 사용 예제
///
/// 이 프로그램은 프로세스 내부 채널을 복제 스트림으로 사용해 트랜잭션 하나를 흘려보내고,
/// 디스패치된 변경 이벤트와 마지막 저장 오프셋을 JSON으로 출력합니다.
use chrono::Utc;
use rust_vitess::connection::{ReplicationEventSender, ReplicationEvent};
use rust_vitess::events::{CellValue, Column, MessageHeader, ReplicationMessage, RowChange};
use rust_vitess::observer::LargeRowObserver;
use rust_vitess::offset::{Partition, StoredOffset};
use rust_vitess::streaming::{ProducerErrorHandler, RunningFlag, SessionEnd};
use rust_vitess::vgtid::{ShardGtid, Vgtid};
use rust_vitess::{
    CdcError, ChannelDispatcher, ChannelReplicationConnection, ConnectorConfig,
    StreamingChangeEventSource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const DEMO_HOST: &str = "16b1039f-22b6-11ed-b765-0a43f95f28a3";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let config = ConnectorConfig::from_env()?;
    info!(
        "Starting Vitess CDC streaming for {} (keyspace {})",
        config.server_name, config.keyspace
    );

    let (connection, transport) = ChannelReplicationConnection::new(64);
    let (dispatcher, mut events) = ChannelDispatcher::new(config.dispatch_channel_capacity);
    let handler = Arc::new(ProducerErrorHandler::new());
    let observer = LargeRowObserver::from_config(&config)?;

    let mut source = StreamingChangeEventSource::new(
        config.clone(),
        connection,
        Arc::new(dispatcher),
        handler.clone(),
    )
    .with_observer(Arc::new(observer));
    let mut offsets = source.offsets();
    let partition = Partition::new(config.server_name.clone());

    // 디스패치된 이벤트 출력
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to serialize event: {}", e),
            }
        }
    });

    let shard = config
        .shards
        .first()
        .cloned()
        .unwrap_or_else(|| "0".to_string());
    let script = scripted_transaction(&config.keyspace, &shard);
    let final_vgtid = script
        .last()
        .map(|event| event.new_vgtid.clone())
        .unwrap_or_else(|| config.initial_vgtid());

    let flag = RunningFlag::new();
    let driver = async {
        let result = drive(&transport, script, &mut offsets, &final_vgtid).await;
        flag.stop();
        result
    };

    let (end, driven) = tokio::join!(source.execute(&flag, partition, None), driver);
    if let Err(e) = driven {
        warn!("Scripted transaction was not fully processed: {}", e);
    }

    println!("{}", offsets.borrow().to_json()?);

    drop(source);
    printer.await?;

    if end == SessionEnd::Failed {
        if let Some(e) = handler.take_error() {
            return Err(e.into());
        }
    }
    info!("Streaming finished");
    Ok(())
}

/// 스크립트를 전송하고 마지막 위치가 저장될 때까지 대기
async fn drive(
    transport: &ReplicationEventSender,
    script: Vec<ReplicationEvent>,
    offsets: &mut watch::Receiver<StoredOffset>,
    final_vgtid: &Vgtid,
) -> rust_vitess::Result<()> {
    for event in script {
        transport
            .send(Ok(event))
            .await
            .map_err(|_| CdcError::ChannelClosed)?;
    }

    // 마지막 행이 아니라 COMMIT까지 처리된 위치를 기다림
    let reached = offsets.wait_for(|offset| committed_at(offset, final_vgtid));
    match tokio::time::timeout(Duration::from_secs(5), reached).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(CdcError::ChannelClosed),
        Err(_) => Err(CdcError::Other(format!(
            "Position {} was not reached",
            final_vgtid
        ))),
    }
}

fn committed_at(offset: &StoredOffset, position: &Vgtid) -> bool {
    &offset.vgtid == position && offset.transaction_id.is_none()
}

/// 두 행짜리 트랜잭션: BEGIN, INSERT, UPDATE(마지막 행), COMMIT
fn scripted_transaction(keyspace: &str, shard: &str) -> Vec<ReplicationEvent> {
    let position = |seq: u64| {
        Vgtid::new(vec![ShardGtid::new(
            keyspace,
            shard,
            format!("MySQL56/{}:1-{}", DEMO_HOST, seq),
        )])
    };
    let header = || MessageHeader::new(keyspace, shard, Utc::now());
    let table = format!("{}.orders", keyspace);

    vec![
        ReplicationEvent::new(
            ReplicationMessage::Begin(
                header().with_transaction_id(format!("MySQL56/{}:1-11", DEMO_HOST)),
            ),
            position(10),
        ),
        ReplicationEvent::new(
            ReplicationMessage::Row {
                header: header(),
                change: RowChange::insert(
                    table.clone(),
                    vec![
                        Column::new("id", CellValue::Int64(1)),
                        Column::new("status", CellValue::String("created".to_string())),
                    ],
                ),
            },
            position(10),
        ),
        ReplicationEvent::new(
            ReplicationMessage::Row {
                header: header(),
                change: RowChange::update(
                    table,
                    vec![
                        Column::new("id", CellValue::Int64(1)),
                        Column::new("status", CellValue::String("created".to_string())),
                    ],
                    vec![
                        Column::new("id", CellValue::Int64(1)),
                        Column::new("status", CellValue::String("paid".to_string())),
                    ],
                ),
            },
            position(11),
        )
        .last_row(),
        ReplicationEvent::new(ReplicationMessage::Commit(header()), position(11)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_transaction_shape() {
        let script = scripted_transaction("commerce", "-80");
        assert_eq!(script.len(), 4);
        assert!(matches!(script[0].message, ReplicationMessage::Begin(_)));
        assert!(!script[1].is_last_row_of_transaction);
        assert!(script[2].is_last_row_of_transaction);
        assert_eq!(script[2].new_vgtid, script[3].new_vgtid);
        assert_ne!(script[1].new_vgtid, script[2].new_vgtid);
    }

    #[test]
    fn test_committed_at_requires_closed_transaction() {
        let script = scripted_transaction("commerce", "-80");
        let position = script[3].new_vgtid.clone();
        let mut offset = StoredOffset {
            vgtid: position.clone(),
            ts_usec: 0,
            transaction_id: Some(format!("MySQL56/{}:1-11", DEMO_HOST)),
            shard_epochs: Default::default(),
        };
        // 마지막 행까지만 처리된 상태
        assert!(!committed_at(&offset, &position));

        offset.transaction_id = None;
        assert!(committed_at(&offset, &position));
        assert!(!committed_at(&offset, &script[0].new_vgtid));
    }
}
