//! 스트리밍 세션
//!
//! 한 세션은 두 흐름으로 나뉩니다.
//! 1. 감독 루프 (`StreamingChangeEventSource::execute`): 연결을 열고, 중단 신호나 에러 슬롯을 폴링하다가, 항상 연결을 닫음
//! 2. 전달 흐름 (`MessageProcessor`): 전송 계층이 메시지마다 호출. 위치 갱신과 디스패치를 모두 여기서 수행
//!
//! 두 흐름이 공유하는 것은 `ErrorSlot` 하나뿐입니다.

use crate::config::ConnectorConfig;
use crate::connection::{ErrorSlot, ReplicationConnection, ReplicationMessageProcessor};
use crate::dispatcher::EventDispatcher;
use crate::error::{CdcError, Result};
use crate::events::{
    ChangeRecord, MessageHeader, ReplicationMessage, RowChange, TableId, TransactionInfo,
};
use crate::observer::{DispatchObserver, DispatchedRow};
use crate::offset::{OffsetContext, Partition, StoredOffset};
use crate::rank::{RankProvider, VitessRankProvider};
use crate::vgtid::Vgtid;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 세션을 계속 실행할지 알려주는 외부 신호
pub trait ChangeEventSourceContext: Send + Sync {
    fn is_running(&self) -> bool;
}

/// 원자적 "계속 실행" 플래그
#[derive(Debug, Clone)]
pub struct RunningFlag {
    running: Arc<AtomicBool>,
}

impl RunningFlag {
    pub fn new() -> Self {
        RunningFlag {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for RunningFlag {
    fn default() -> Self {
        RunningFlag::new()
    }
}

impl ChangeEventSourceContext for RunningFlag {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 치명적 에러를 넘겨받는 협력자 (세션당 최대 한 번 호출)
pub trait ErrorHandler: Send + Sync {
    fn set_producer_error(&self, error: CdcError);
}

/// 첫 번째 에러를 보관하는 에러 핸들러
#[derive(Debug, Default)]
pub struct ProducerErrorHandler {
    error: Mutex<Option<CdcError>>,
    reports: AtomicUsize,
}

impl ProducerErrorHandler {
    pub fn new() -> Self {
        ProducerErrorHandler::default()
    }

    pub fn report_count(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn take_error(&self) -> Option<CdcError> {
        self.error.lock().take()
    }
}

impl ErrorHandler for ProducerErrorHandler {
    fn set_producer_error(&self, error: CdcError) {
        self.reports.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.error.lock();
        if slot.is_some() {
            warn!("Ignoring additional producer error: {}", error);
            return;
        }
        *slot = Some(error);
    }
}

/// 트랜잭션 경계 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    InTransaction {
        transaction_id: String,
        shard: String,
    },
    /// 처리 실패 후 종료 상태. 이후 메시지는 모두 거부됨
    Failed,
}

/// 메시지 분류 및 트랜잭션 경계 처리
pub struct MessageProcessor {
    partition: Partition,
    offset: OffsetContext,
    dispatcher: Arc<dyn EventDispatcher>,
    ranks: Arc<dyn RankProvider>,
    observers: Vec<Arc<dyn DispatchObserver>>,
    provide_ordered_transaction_metadata: bool,
    offsets: Arc<watch::Sender<StoredOffset>>,
    state: TransactionState,
}

impl MessageProcessor {
    pub fn new(
        partition: Partition,
        offset: OffsetContext,
        dispatcher: Arc<dyn EventDispatcher>,
        ranks: Arc<dyn RankProvider>,
        offsets: Arc<watch::Sender<StoredOffset>>,
    ) -> Self {
        MessageProcessor {
            partition,
            offset,
            dispatcher,
            ranks,
            observers: Vec::new(),
            provide_ordered_transaction_metadata: false,
            offsets,
            state: TransactionState::Idle,
        }
    }

    pub fn with_observers(mut self, observers: Vec<Arc<dyn DispatchObserver>>) -> Self {
        self.observers = observers;
        self
    }

    pub fn with_ordered_transaction_metadata(mut self, enabled: bool) -> Self {
        self.provide_ordered_transaction_metadata = enabled;
        self
    }

    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    pub fn offset_context(&self) -> &OffsetContext {
        &self.offset
    }

    async fn handle(
        &mut self,
        message: ReplicationMessage,
        new_vgtid: Vgtid,
        is_last_row_of_transaction: bool,
    ) -> Result<()> {
        match message {
            ReplicationMessage::Begin(header) => self.handle_begin(header, new_vgtid).await,
            ReplicationMessage::Commit(header) => self.handle_commit(header, new_vgtid).await,
            ReplicationMessage::Ddl { header, statement } => {
                debug!("DDL on shard {}: {}", header.shard, statement);
                self.offset.rotate_vgtid(new_vgtid, header.commit_time);
                Ok(())
            }
            ReplicationMessage::Other(header) => {
                debug!("Control message on shard {}", header.shard);
                self.offset.rotate_vgtid(new_vgtid, header.commit_time);
                Ok(())
            }
            ReplicationMessage::Row { header, change } => {
                self.handle_row(header, change, new_vgtid, is_last_row_of_transaction)
                    .await
            }
        }
    }

    async fn handle_begin(&mut self, header: MessageHeader, new_vgtid: Vgtid) -> Result<()> {
        if let TransactionState::InTransaction { transaction_id, .. } = &self.state {
            warn!(
                "BEGIN on shard {} while transaction {} is still open",
                header.shard, transaction_id
            );
        }

        // 헤더에 식별자가 없으면 새 위치의 샤드 GTID를 사용
        let transaction_id = match header.transaction_id {
            Some(ref id) => id.clone(),
            None => new_vgtid
                .get(&header.keyspace, &header.shard)
                .map(|shard_gtid| shard_gtid.gtid.clone())
                .ok_or_else(|| {
                    CdcError::InvalidIdentifier(format!(
                        "No transaction id for BEGIN on {}/{}",
                        header.keyspace, header.shard
                    ))
                })?,
        };

        self.offset.rotate_vgtid(new_vgtid, header.commit_time);

        let order = if self.provide_ordered_transaction_metadata {
            Some(
                self.offset
                    .order_transaction(self.ranks.as_ref(), &header.shard, &transaction_id)?,
            )
        } else {
            None
        };

        self.offset
            .begin_transaction(Some(transaction_id.clone()), order);
        let info = TransactionInfo {
            transaction_id: transaction_id.clone(),
            shard: header.shard.clone(),
            order,
        };
        self.dispatcher
            .dispatch_transaction_started_event(
                &self.partition,
                &info,
                &self.offset,
                header.commit_time,
            )
            .await?;

        self.state = TransactionState::InTransaction {
            transaction_id,
            shard: header.shard,
        };
        Ok(())
    }

    async fn handle_commit(&mut self, header: MessageHeader, new_vgtid: Vgtid) -> Result<()> {
        if self.state == TransactionState::Idle {
            warn!("COMMIT on shard {} without an open transaction", header.shard);
        }

        self.offset.rotate_vgtid(new_vgtid, header.commit_time);
        self.dispatcher
            .dispatch_transaction_committed_event(&self.partition, &self.offset, header.commit_time)
            .await?;
        self.offset.commit_transaction();

        self.state = TransactionState::Idle;
        Ok(())
    }

    async fn handle_row(
        &mut self,
        header: MessageHeader,
        change: RowChange,
        new_vgtid: Vgtid,
        is_last_row_of_transaction: bool,
    ) -> Result<()> {
        let table_id = resolve_table(&header, &change.table)?;

        if self.state == TransactionState::Idle {
            debug!("Row change for {} outside of a transaction", table_id);
        }

        self.offset.event(&table_id, header.commit_time);
        self.offset.set_shard(&header.shard);
        if is_last_row_of_transaction {
            self.offset.reset_vgtid(new_vgtid, header.commit_time);
        }

        let payload_bytes = change.estimated_size();
        let source = self.offset.source_info_for_dispatch();
        let block = self.offset.transaction_block(&table_id);
        let record = ChangeRecord::new(table_id.clone(), change, source, block);

        self.dispatcher
            .dispatch_data_change_event(&self.partition, &table_id, record)
            .await?;

        let row = DispatchedRow {
            table_id,
            shard: header.shard,
            payload_bytes,
        };
        for observer in &self.observers {
            observer.on_data_change_dispatched(&row);
        }
        Ok(())
    }
}

/// "keyspace.table" 또는 "table" 형식의 테이블 이름 해석
fn resolve_table(header: &MessageHeader, table: &str) -> Result<TableId> {
    let mut table_id = TableId::parse(table).ok_or_else(|| {
        CdcError::UnresolvableTable(format!("'{}' on shard {}", table, header.shard))
    })?;
    if table_id.keyspace.is_none() {
        table_id.keyspace = Some(header.keyspace.clone());
    }
    Ok(table_id)
}

#[async_trait]
impl ReplicationMessageProcessor for MessageProcessor {
    async fn process(
        &mut self,
        message: ReplicationMessage,
        new_vgtid: Vgtid,
        is_last_row_of_transaction: bool,
    ) -> Result<()> {
        if self.state == TransactionState::Failed {
            return Err(CdcError::InvalidState(format!(
                "Session already failed, rejecting {} message",
                message.operation().as_str()
            )));
        }

        match self
            .handle(message, new_vgtid, is_last_row_of_transaction)
            .await
        {
            Ok(()) => {
                self.offsets.send_replace(self.offset.offset());
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }
}

/// 세션 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 중단 신호로 정상 종료
    Stopped,
    /// 치명적 에러 (에러 핸들러로 전달됨)
    Failed,
}

/// 스트리밍 세션 실행기
pub struct StreamingChangeEventSource<C: ReplicationConnection> {
    config: ConnectorConfig,
    connection: C,
    dispatcher: Arc<dyn EventDispatcher>,
    error_handler: Arc<dyn ErrorHandler>,
    ranks: Arc<dyn RankProvider>,
    observers: Vec<Arc<dyn DispatchObserver>>,
    offsets: Arc<watch::Sender<StoredOffset>>,
    session_id: Uuid,
}

impl<C: ReplicationConnection> StreamingChangeEventSource<C> {
    pub fn new(
        config: ConnectorConfig,
        connection: C,
        dispatcher: Arc<dyn EventDispatcher>,
        error_handler: Arc<dyn ErrorHandler>,
    ) -> Self {
        let (offsets, _) = watch::channel(OffsetContext::initial(&config).offset());
        StreamingChangeEventSource {
            config,
            connection,
            dispatcher,
            error_handler,
            ranks: Arc::new(VitessRankProvider),
            observers: Vec::new(),
            offsets: Arc::new(offsets),
            session_id: Uuid::new_v4(),
        }
    }

    pub fn with_rank_provider(mut self, ranks: Arc<dyn RankProvider>) -> Self {
        self.ranks = ranks;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// 메시지 처리가 끝날 때마다 갱신되는 저장용 오프셋
    pub fn offsets(&self) -> watch::Receiver<StoredOffset> {
        self.offsets.subscribe()
    }

    /// 세션 실행
    ///
    /// 중단 신호나 치명적 에러가 있을 때까지 대기합니다. 에러는 재시도 없이 에러 핸들러로 넘기며,
    /// 어떤 경로로 끝나든 연결을 닫습니다.
    pub async fn execute(
        &mut self,
        context: &dyn ChangeEventSourceContext,
        partition: Partition,
        offset: Option<OffsetContext>,
    ) -> SessionEnd {
        let offset = match offset {
            Some(offset) => offset,
            None => {
                info!(
                    "No previous offset for {}, starting from configured position",
                    partition
                );
                OffsetContext::initial(&self.config)
            }
        };
        self.offsets.send_replace(offset.offset());

        let end = match self.stream(context, partition, offset).await {
            Ok(()) => SessionEnd::Stopped,
            Err(e) => {
                error!("Streaming session {} failed: {}", self.session_id, e);
                self.error_handler.set_producer_error(e);
                SessionEnd::Failed
            }
        };

        if let Err(e) = self.connection.close().await {
            error!("Failed to close replication connection: {}", e);
        }
        info!("Streaming session {} finished: {:?}", self.session_id, end);
        end
    }

    async fn stream(
        &mut self,
        context: &dyn ChangeEventSourceContext,
        partition: Partition,
        offset: OffsetContext,
    ) -> Result<()> {
        let error_slot = Arc::new(ErrorSlot::new());
        let start = offset.restart_vgtid().clone();
        info!(
            "Streaming session {} for {} starting at {}",
            self.session_id, partition, start
        );

        let processor = MessageProcessor::new(
            partition,
            offset,
            self.dispatcher.clone(),
            self.ranks.clone(),
            self.offsets.clone(),
        )
        .with_observers(self.observers.clone())
        .with_ordered_transaction_metadata(self.config.provide_ordered_transaction_metadata);

        self.connection
            .start_streaming(start, Box::new(processor), error_slot.clone())
            .await?;

        while context.is_running() && !error_slot.is_set() {
            tokio::time::sleep(self.config.poll_interval).await;
        }

        if let Some(e) = error_slot.take() {
            return Err(e);
        }
        info!("Streaming session {} stopped", self.session_id);
        Ok(())
    }
}
