//! 스트리밍 위치 추적 (OffsetContext 및 SourceInfo)
//!
//! 세션마다 하나의 OffsetContext가 만들어지며, 전달 스레드에서만 변경됩니다.
//! 디스패처는 메시지에 대한 모든 변경이 끝난 뒤에만 읽습니다.

use crate::config::ConnectorConfig;
use crate::error::{CdcError, Result};
use crate::events::{TableId, TransactionBlock};
use crate::rank::{RankProvider, VitessRankProvider};
use crate::transaction::{self, EpochProvider, TransactionContext, TransactionOrder};
use crate::vgtid::Vgtid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, warn};

/// 오프셋의 범위를 정하는 논리 소스 (세션 동안 불변)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub server_name: String,
}

impl Partition {
    pub fn new(server_name: impl Into<String>) -> Self {
        Partition {
            server_name: server_name.into(),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.server_name)
    }
}

/// 이벤트에 찍히는 소스 위치 정보 (Debezium의 SourceInfo와 유사)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub server_name: String,
    pub keyspace: String,
    /// 마지막으로 처리한 행의 샤드
    pub shard: Option<String>,
    /// 재시작 위치
    pub vgtid: Vgtid,
    /// 마지막 이벤트 커밋 시각
    pub ts: DateTime<Utc>,
    /// 마지막으로 처리한 테이블
    pub table: Option<TableId>,
}

impl SourceInfo {
    pub fn new(server_name: String, keyspace: String, vgtid: Vgtid, ts: DateTime<Utc>) -> Self {
        SourceInfo {
            server_name,
            keyspace,
            shard: None,
            vgtid,
            ts,
            table: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.server_name,
            "keyspace": self.keyspace,
            "shard": self.shard,
            "vgtid": self.vgtid.to_string(),
            "ts_ms": self.ts.timestamp_millis(),
            "table": self.table.as_ref().map(|t| t.table.clone()),
        })
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SourceInfo {{ keyspace: {}, shard: {:?}, vgtid: {} }}",
            self.keyspace, self.shard, self.vgtid
        )
    }
}

/// 트랜잭션 마지막 행을 위한 2단계 VGTID 적용
///
/// `stage`로 다음 위치를 올려두고, 마지막 행을 디스패치하는 시점에 `commit`으로 적용합니다.
/// 올려둔 값은 commit 전까지 SourceInfo에 보이지 않습니다.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingVgtid {
    staged: Option<(Vgtid, DateTime<Utc>)>,
}

impl PendingVgtid {
    pub fn stage(&mut self, vgtid: Vgtid, ts: DateTime<Utc>) {
        if let Some((previous, _)) = self.staged.replace((vgtid, ts)) {
            debug!("Replacing staged vgtid {} before it was applied", previous);
        }
    }

    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// 적용하지 않고 버림. 버린 값이 있었으면 true
    pub fn discard(&mut self) -> bool {
        self.staged.take().is_some()
    }

    /// 올려둔 위치를 SourceInfo에 적용. 적용했으면 true
    pub fn commit(&mut self, source: &mut SourceInfo) -> bool {
        match self.staged.take() {
            Some((vgtid, ts)) => {
                source.vgtid = vgtid;
                source.ts = ts;
                true
            }
            None => false,
        }
    }
}

/// 프레임워크가 저장하고 다음 세션의 시작 위치로 되돌려주는 오프셋
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOffset {
    pub vgtid: Vgtid,
    pub ts_usec: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shard_epochs: BTreeMap<String, u64>,
}

impl StoredOffset {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let offset: StoredOffset = serde_json::from_str(json)?;
        if offset.vgtid.is_empty() {
            return Err(CdcError::VgtidError(format!(
                "Stored offset has no shard positions: {}",
                json
            )));
        }
        Ok(offset)
    }
}

/// 세션 위치 모델
#[derive(Debug, Clone)]
pub struct OffsetContext {
    source_info: SourceInfo,
    pending: PendingVgtid,
    transaction: TransactionContext,
    epochs: EpochProvider,
    shard_event_counts: BTreeMap<String, u64>,
    table_event_counts: HashMap<TableId, u64>,
}

impl OffsetContext {
    fn with_source(source_info: SourceInfo, epochs: EpochProvider) -> Self {
        OffsetContext {
            source_info,
            pending: PendingVgtid::default(),
            transaction: TransactionContext::default(),
            epochs,
            shard_event_counts: BTreeMap::new(),
            table_event_counts: HashMap::new(),
        }
    }

    /// 설정으로부터 새 세션 위치 생성
    pub fn initial(config: &ConnectorConfig) -> Self {
        let source = SourceInfo::new(
            config.server_name.clone(),
            config.keyspace.clone(),
            config.initial_vgtid(),
            Utc::now(),
        );
        OffsetContext::with_source(source, EpochProvider::new())
    }

    /// 저장된 오프셋에서 복원
    pub fn load(config: &ConnectorConfig, stored: StoredOffset) -> Result<Self> {
        if stored.vgtid.is_empty() {
            return Err(CdcError::VgtidError(
                "Cannot resume from an empty vgtid".to_string(),
            ));
        }
        let ts = DateTime::<Utc>::from_timestamp_micros(stored.ts_usec).ok_or_else(|| {
            CdcError::VgtidError(format!("Invalid offset timestamp: {}", stored.ts_usec))
        })?;

        let epochs = EpochProvider::with_epochs(stored.shard_epochs, &stored.vgtid);
        let source = SourceInfo::new(
            config.server_name.clone(),
            config.keyspace.clone(),
            stored.vgtid,
            ts,
        );
        Ok(OffsetContext::with_source(source, epochs))
    }

    /// 재시작 위치 (이벤트에 찍히는 위치)
    pub fn restart_vgtid(&self) -> &Vgtid {
        &self.source_info.vgtid
    }

    pub fn source_info(&self) -> &SourceInfo {
        &self.source_info
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.source_info.ts
    }

    /// 위치 교체 (BEGIN/COMMIT/DDL/OTHER)
    ///
    /// 올려둔 대기 위치는 버려집니다. 샤드 위치가 뒤로 가면 경고만 남깁니다.
    pub fn rotate_vgtid(&mut self, new_vgtid: Vgtid, ts: DateTime<Utc>) {
        let regressed = new_vgtid.regressions_from(&self.source_info.vgtid, &VitessRankProvider);
        if !regressed.is_empty() {
            warn!(
                "Position moved backwards for shards {:?}: {} -> {}",
                regressed, self.source_info.vgtid, new_vgtid
            );
        }
        if self.pending.discard() {
            debug!("Discarded staged vgtid on rotation to {}", new_vgtid);
        }
        self.source_info.vgtid = new_vgtid;
        self.source_info.ts = ts;
    }

    /// 행 이벤트 기록 (위치는 바뀌지 않음)
    pub fn event(&mut self, table: &TableId, ts: DateTime<Utc>) {
        self.transaction.event(table);
        *self.table_event_counts.entry(table.clone()).or_insert(0) += 1;
        self.source_info.table = Some(table.clone());
        self.source_info.ts = ts;
    }

    pub fn set_shard(&mut self, shard: &str) {
        *self.shard_event_counts.entry(shard.to_string()).or_insert(0) += 1;
        self.source_info.shard = Some(shard.to_string());
    }

    /// 트랜잭션 마지막 행 직전에 호출: 다음에 디스패치되는 이벤트에만 새 위치 적용
    pub fn reset_vgtid(&mut self, new_vgtid: Vgtid, ts: DateTime<Utc>) {
        self.pending.stage(new_vgtid, ts);
    }

    pub fn has_pending_vgtid(&self) -> bool {
        self.pending.is_staged()
    }

    /// 디스패치 시점의 SourceInfo 스냅샷 (대기 위치가 있으면 이때 적용)
    pub fn source_info_for_dispatch(&mut self) -> SourceInfo {
        if self.pending.commit(&mut self.source_info) {
            debug!("Applied staged vgtid {}", self.source_info.vgtid);
        }
        self.source_info.clone()
    }

    pub fn begin_transaction(
        &mut self,
        transaction_id: Option<String>,
        order: Option<TransactionOrder>,
    ) {
        self.transaction.begin(transaction_id, order);
    }

    pub fn commit_transaction(&mut self) {
        self.transaction.end();
    }

    /// 샤드 epoch를 갱신하며 (epoch, rank) 계산
    pub fn order_transaction(
        &mut self,
        ranks: &dyn RankProvider,
        shard: &str,
        transaction_id: &str,
    ) -> Result<TransactionOrder> {
        transaction::order_transaction(&mut self.epochs, ranks, shard, transaction_id)
    }

    pub fn transaction(&self) -> &TransactionContext {
        &self.transaction
    }

    /// 현재 트랜잭션 안의 행이면 트랜잭션 블록 생성
    pub fn transaction_block(&self, table: &TableId) -> Option<TransactionBlock> {
        let id = self.transaction.transaction_id()?;
        Some(TransactionBlock {
            id: id.to_string(),
            total_order: self.transaction.total_order(),
            data_collection_order: self.transaction.table_order(table),
            order: self.transaction.order(),
        })
    }

    pub fn shard_event_count(&self, shard: &str) -> u64 {
        self.shard_event_counts.get(shard).copied().unwrap_or(0)
    }

    pub fn table_event_count(&self, table: &TableId) -> u64 {
        self.table_event_counts.get(table).copied().unwrap_or(0)
    }

    /// 저장용 오프셋
    pub fn offset(&self) -> StoredOffset {
        StoredOffset {
            vgtid: self.source_info.vgtid.clone(),
            ts_usec: self.source_info.ts.timestamp_micros(),
            transaction_id: self.transaction.transaction_id().map(String::from),
            shard_epochs: self.epochs.epochs().clone(),
        }
    }
}
