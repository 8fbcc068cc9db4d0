//! 복제 연결 경계
//!
//! 전송 계층은 "위치 P부터 스트리밍 시작, 메시지마다 콜백 호출, 치명적 에러는 에러 슬롯으로 보고"
//! 라는 좁은 인터페이스로만 보입니다.

use crate::error::{CdcError, Result};
use crate::events::ReplicationMessage;
use crate::vgtid::Vgtid;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 전송 계층이 콜백에 넘기는 단위
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationEvent {
    pub message: ReplicationMessage,
    /// 이 메시지 처리 후 적용할 위치
    pub new_vgtid: Vgtid,
    pub is_last_row_of_transaction: bool,
}

impl ReplicationEvent {
    pub fn new(message: ReplicationMessage, new_vgtid: Vgtid) -> Self {
        ReplicationEvent {
            message,
            new_vgtid,
            is_last_row_of_transaction: false,
        }
    }

    pub fn last_row(mut self) -> Self {
        self.is_last_row_of_transaction = true;
        self
    }
}

/// 메시지별 콜백
///
/// 전송 계층은 호출을 하나씩, 겹치지 않게 수행합니다.
#[async_trait]
pub trait ReplicationMessageProcessor: Send {
    async fn process(
        &mut self,
        message: ReplicationMessage,
        new_vgtid: Vgtid,
        is_last_row_of_transaction: bool,
    ) -> Result<()>;
}

/// 전달 스레드와 감독 루프가 공유하는 단일 할당 에러 슬롯
///
/// 첫 번째 에러만 기록되고, 기록이 끝난 뒤에 `is_set`이 참이 됩니다.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    published: AtomicBool,
    error: Mutex<Option<CdcError>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        ErrorSlot::default()
    }

    /// 에러 기록. 이미 기록된 에러가 있으면 false
    pub fn publish(&self, error: CdcError) -> bool {
        let mut slot = self.error.lock();
        if self.published.load(Ordering::Acquire) {
            warn!("Dropping error reported after the first one: {}", error);
            return false;
        }
        *slot = Some(error);
        self.published.store(true, Ordering::Release);
        true
    }

    pub fn is_set(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    pub fn take(&self) -> Option<CdcError> {
        self.error.lock().take()
    }
}

/// 복제 연결
#[async_trait]
pub trait ReplicationConnection: Send {
    async fn start_streaming(
        &mut self,
        from: Vgtid,
        processor: Box<dyn ReplicationMessageProcessor>,
        error: Arc<ErrorSlot>,
    ) -> Result<()>;

    /// 연결 해제 (여러 번 호출해도 안전해야 함)
    async fn close(&mut self) -> Result<()>;
}

pub type ReplicationEventSender = mpsc::Sender<Result<ReplicationEvent>>;

/// 프로세스 내부 채널로 메시지를 받는 복제 연결
///
/// 채널의 `Err` 항목은 전송 계층의 치명적 에러로 취급됩니다.
pub struct ChannelReplicationConnection {
    receiver: Option<mpsc::Receiver<Result<ReplicationEvent>>>,
    delivery: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
    start_position: Option<Vgtid>,
    close_count: usize,
}

impl ChannelReplicationConnection {
    pub fn new(capacity: usize) -> (Self, ReplicationEventSender) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            ChannelReplicationConnection {
                receiver: Some(receiver),
                delivery: None,
                start_position: None,
                close_count: 0,
            },
            sender,
        )
    }

    /// 스트리밍을 시작한 위치
    pub fn start_position(&self) -> Option<&Vgtid> {
        self.start_position.as_ref()
    }

    pub fn close_count(&self) -> usize {
        self.close_count
    }
}

#[async_trait]
impl ReplicationConnection for ChannelReplicationConnection {
    async fn start_streaming(
        &mut self,
        from: Vgtid,
        processor: Box<dyn ReplicationMessageProcessor>,
        error: Arc<ErrorSlot>,
    ) -> Result<()> {
        let receiver = self.receiver.take().ok_or_else(|| {
            CdcError::InvalidState("Replication stream was already started".to_string())
        })?;

        info!("Starting replication stream from {}", from);
        self.start_position = Some(from);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let panic_slot = error.clone();
        let delivery = tokio::spawn(deliver(receiver, processor, error, shutdown_rx));

        // 전달 태스크의 panic도 치명적 에러로 보고
        let handle = tokio::spawn(async move {
            if let Err(e) = delivery.await {
                if e.is_panic() {
                    error!("Delivery task panicked: {}", e);
                    panic_slot.publish(CdcError::ConnectionError(format!(
                        "Delivery task panicked: {}",
                        e
                    )));
                }
            }
        });
        self.delivery = Some((shutdown_tx, handle));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.close_count += 1;
        let Some((shutdown, handle)) = self.delivery.take() else {
            return Ok(());
        };

        // 처리 중인 메시지는 끝까지 진행된 뒤 전달 루프가 멈춤
        let _ = shutdown.send(());
        handle
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Delivery task failed: {}", e)))?;
        info!("Replication connection closed");
        Ok(())
    }
}

/// 전달 루프: 메시지를 하나씩 콜백에 넘김
async fn deliver(
    mut receiver: mpsc::Receiver<Result<ReplicationEvent>>,
    mut processor: Box<dyn ReplicationMessageProcessor>,
    error: Arc<ErrorSlot>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut delivered: u64 = 0;

    loop {
        let item = tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("Delivery stopped after {} messages", delivered);
                return;
            }
            item = receiver.recv() => item,
        };

        let event = match item {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                error!("Replication transport failed: {}", e);
                error.publish(e);
                return;
            }
            None => {
                error!("Replication stream ended after {} messages", delivered);
                error.publish(CdcError::ConnectionError(
                    "Replication stream ended".to_string(),
                ));
                return;
            }
        };

        if let Err(e) = processor
            .process(
                event.message,
                event.new_vgtid,
                event.is_last_row_of_transaction,
            )
            .await
        {
            error!("Failed to process replication message: {}", e);
            error.publish(e);
            return;
        }
        delivered += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MessageHeader;
    use crate::vgtid::ShardGtid;
    use chrono::Utc;
    use std::time::Duration;
    use tokio_test::assert_ok;

    #[derive(Clone, Default)]
    struct RecordingProcessor {
        seen: Arc<Mutex<Vec<(String, bool)>>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl ReplicationMessageProcessor for RecordingProcessor {
        async fn process(
            &mut self,
            message: ReplicationMessage,
            _new_vgtid: Vgtid,
            is_last_row_of_transaction: bool,
        ) -> Result<()> {
            let mut seen = self.seen.lock();
            if Some(seen.len()) == self.fail_on {
                return Err(CdcError::UnresolvableTable("bad".to_string()));
            }
            seen.push((
                message.operation().as_str().to_string(),
                is_last_row_of_transaction,
            ));
            Ok(())
        }
    }

    fn vgtid() -> Vgtid {
        Vgtid::new(vec![ShardGtid::new("commerce", "-80", "MySQL56/abc:1-5")])
    }

    fn begin() -> ReplicationEvent {
        ReplicationEvent::new(
            ReplicationMessage::Begin(MessageHeader::new("commerce", "-80", Utc::now())),
            vgtid(),
        )
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_error_slot_single_assignment() {
        let slot = ErrorSlot::new();
        assert!(!slot.is_set());
        assert!(slot.publish(CdcError::ConnectionError("first".to_string())));
        assert!(!slot.publish(CdcError::ConnectionError("second".to_string())));
        assert!(slot.is_set());

        match slot.take() {
            Some(CdcError::ConnectionError(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected: {:?}", other),
        }
        // 가져간 뒤에도 다시 기록되지 않음
        assert!(!slot.publish(CdcError::ChannelClosed));
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_error_slot_concurrent_publish() {
        let slot = Arc::new(ErrorSlot::new());
        let winners: usize = (0..8)
            .map(|i| {
                let slot = slot.clone();
                std::thread::spawn(move || slot.publish(CdcError::Other(i.to_string())))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
        assert!(slot.take().is_some());
    }

    #[tokio::test]
    async fn test_channel_connection_delivers_in_order() {
        let (mut conn, tx) = ChannelReplicationConnection::new(8);
        let processor = RecordingProcessor::default();
        let seen = processor.seen.clone();
        let slot = Arc::new(ErrorSlot::new());

        assert_ok!(conn.start_streaming(vgtid(), Box::new(processor), slot.clone()).await);
        assert_eq!(conn.start_position(), Some(&vgtid()));

        tx.send(Ok(begin())).await.unwrap();
        let mut last = begin();
        last.message =
            ReplicationMessage::Commit(MessageHeader::new("commerce", "-80", Utc::now()));
        tx.send(Ok(last.last_row())).await.unwrap();

        wait_until(|| seen.lock().len() == 2).await;
        assert_eq!(
            *seen.lock(),
            vec![("BEGIN".to_string(), false), ("COMMIT".to_string(), true)]
        );
        assert!(!slot.is_set());

        assert_ok!(conn.close().await);
        assert_ok!(conn.close().await);
        assert_eq!(conn.close_count(), 2);
    }

    #[tokio::test]
    async fn test_transport_error_is_published() {
        let (mut conn, tx) = ChannelReplicationConnection::new(8);
        let slot = Arc::new(ErrorSlot::new());
        conn.start_streaming(vgtid(), Box::new(RecordingProcessor::default()), slot.clone())
            .await
            .unwrap();

        tx.send(Err(CdcError::ConnectionError("stream reset".to_string())))
            .await
            .unwrap();
        wait_until(|| slot.is_set()).await;
        assert!(matches!(slot.take(), Some(CdcError::ConnectionError(_))));
        assert_ok!(conn.close().await);
    }

    #[tokio::test]
    async fn test_processor_error_stops_delivery() {
        let (mut conn, tx) = ChannelReplicationConnection::new(8);
        let processor = RecordingProcessor {
            fail_on: Some(1),
            ..Default::default()
        };
        let seen = processor.seen.clone();
        let slot = Arc::new(ErrorSlot::new());
        conn.start_streaming(vgtid(), Box::new(processor), slot.clone())
            .await
            .unwrap();

        for _ in 0..3 {
            tx.send(Ok(begin())).await.unwrap();
        }
        wait_until(|| slot.is_set()).await;
        assert_eq!(seen.lock().len(), 1);
        assert!(matches!(slot.take(), Some(CdcError::UnresolvableTable(_))));
        conn.close().await.unwrap();
    }

    struct PanickingProcessor;

    #[async_trait]
    impl ReplicationMessageProcessor for PanickingProcessor {
        async fn process(&mut self, _: ReplicationMessage, _: Vgtid, _: bool) -> Result<()> {
            panic!("dispatcher blew up");
        }
    }

    #[tokio::test]
    async fn test_stream_end_is_published() {
        let (mut conn, tx) = ChannelReplicationConnection::new(8);
        let processor = RecordingProcessor::default();
        let seen = processor.seen.clone();
        let slot = Arc::new(ErrorSlot::new());
        conn.start_streaming(vgtid(), Box::new(processor), slot.clone())
            .await
            .unwrap();

        tx.send(Ok(begin())).await.unwrap();
        drop(tx);

        wait_until(|| slot.is_set()).await;
        assert_eq!(seen.lock().len(), 1);
        match slot.take() {
            Some(CdcError::ConnectionError(msg)) => assert!(msg.contains("ended")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_ok!(conn.close().await);
    }

    #[tokio::test]
    async fn test_processor_panic_is_published() {
        let (mut conn, tx) = ChannelReplicationConnection::new(8);
        let slot = Arc::new(ErrorSlot::new());
        conn.start_streaming(vgtid(), Box::new(PanickingProcessor), slot.clone())
            .await
            .unwrap();

        tx.send(Ok(begin())).await.unwrap();
        wait_until(|| slot.is_set()).await;
        match slot.take() {
            Some(CdcError::ConnectionError(msg)) => assert!(msg.contains("panicked")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_ok!(conn.close().await);
        assert_eq!(conn.close_count(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (mut conn, _tx) = ChannelReplicationConnection::new(1);
        let slot = Arc::new(ErrorSlot::new());
        conn.start_streaming(vgtid(), Box::new(RecordingProcessor::default()), slot.clone())
            .await
            .unwrap();
        let second = conn
            .start_streaming(vgtid(), Box::new(RecordingProcessor::default()), slot)
            .await;
        assert!(matches!(second, Err(CdcError::InvalidState(_))));
        conn.close().await.unwrap();
    }
}
