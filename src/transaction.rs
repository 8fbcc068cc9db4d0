//! 트랜잭션 경계 상태 및 샤드 간 순서 메타데이터
//!
//! - `TransactionContext`: 현재 트랜잭션 안에서의 이벤트 순번
//! - `EpochProvider`: 샤드의 호스트 집합이 바뀔 때(reparent 등) 증가하는 epoch
//! - `TransactionOrder`: (epoch, rank) 쌍, 샤드 간 트랜잭션 비교 키

use crate::error::Result;
use crate::events::TableId;
use crate::gtid::GtidSet;
use crate::rank::{RankProvider, TransactionRank};
use crate::vgtid::Vgtid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// 샤드 간 트랜잭션 순서 키 (epoch 우선, 다음 rank)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionOrder {
    pub epoch: u64,
    pub rank: TransactionRank,
}

/// 샤드별 epoch 추적
#[derive(Debug, Clone, Default)]
pub struct EpochProvider {
    epochs: BTreeMap<String, u64>,
    previous: HashMap<String, GtidSet>,
}

impl EpochProvider {
    pub fn new() -> Self {
        EpochProvider::default()
    }

    /// 저장된 오프셋의 epoch로 복원
    ///
    /// 재시작 위치의 샤드 GTID를 직전 호스트 집합으로 삼아, 중단 중의 reparent도 epoch에 반영됩니다.
    pub fn with_epochs(epochs: BTreeMap<String, u64>, restart: &Vgtid) -> Self {
        let mut previous = HashMap::new();
        for shard_gtid in restart.shard_gtids().iter().filter(|s| s.is_positional()) {
            match GtidSet::parse(&shard_gtid.gtid) {
                Ok(gtid) if !gtid.is_empty() => {
                    previous.insert(shard_gtid.shard.clone(), gtid);
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "Ignoring unparsable restart position for shard {}: {}",
                    shard_gtid.shard, e
                ),
            }
        }
        EpochProvider { epochs, previous }
    }

    /// 트랜잭션 GTID에 대한 epoch 계산
    ///
    /// 호스트 집합이 같거나 늘어나면 같은 epoch, 그 외의 변화는 epoch + 1.
    pub fn epoch_for(&mut self, shard: &str, gtid: &GtidSet) -> u64 {
        let epoch = self.epochs.entry(shard.to_string()).or_insert(0);

        if let Some(previous) = self.previous.get(shard) {
            if !gtid.is_host_set_superset_of(previous) {
                *epoch += 1;
                warn!(
                    "Host set of shard {} changed from {} to {}, epoch is now {}",
                    shard, previous, gtid, epoch
                );
            }
        }

        let epoch = *epoch;
        self.previous.insert(shard.to_string(), gtid.clone());
        epoch
    }

    pub fn epochs(&self) -> &BTreeMap<String, u64> {
        &self.epochs
    }
}

/// 트랜잭션 순서 메타데이터 계산
pub fn order_transaction(
    epochs: &mut EpochProvider,
    ranks: &dyn RankProvider,
    shard: &str,
    transaction_id: &str,
) -> Result<TransactionOrder> {
    let rank = ranks.rank(transaction_id)?;
    let gtid = GtidSet::parse(transaction_id)?;
    let epoch = epochs.epoch_for(shard, &gtid);
    debug!(
        "Ordered transaction {} on shard {}: epoch={}, rank={}",
        transaction_id, shard, epoch, rank
    );
    Ok(TransactionOrder { epoch, rank })
}

/// 현재 트랜잭션 내 이벤트 순번
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionContext {
    transaction_id: Option<String>,
    order: Option<TransactionOrder>,
    total_order: u64,
    per_table: HashMap<TableId, u64>,
}

impl TransactionContext {
    pub fn begin(&mut self, transaction_id: Option<String>, order: Option<TransactionOrder>) {
        self.transaction_id = transaction_id;
        self.order = order;
        self.total_order = 0;
        self.per_table.clear();
    }

    pub fn end(&mut self) {
        self.transaction_id = None;
        self.order = None;
        self.total_order = 0;
        self.per_table.clear();
    }

    /// 행 이벤트 기록 후 테이블별 순번 반환
    pub fn event(&mut self, table: &TableId) -> u64 {
        self.total_order += 1;
        let count = self.per_table.entry(table.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn order(&self) -> Option<TransactionOrder> {
        self.order
    }

    pub fn total_order(&self) -> u64 {
        self.total_order
    }

    pub fn table_order(&self, table: &TableId) -> u64 {
        self.per_table.get(table).copied().unwrap_or(0)
    }

    pub fn is_active(&self) -> bool {
        self.transaction_id.is_some()
    }
}
