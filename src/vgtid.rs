//! VGTID: 샤드별 진행 위치의 합성 마커
//!
//! JSON 형식은 Vitess와 동일합니다:
//! `[{"keyspace":"commerce","shard":"-80","gtid":"MySQL56/uuid:1-615"}]`

use crate::error::{CdcError, Result};
use crate::rank::RankProvider;
use serde::{Deserialize, Serialize};
use std::fmt;

/// VStream에 "현재 위치부터" 시작을 요청하는 GTID 값
pub const CURRENT_GTID: &str = "current";

/// 샤드 하나의 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGtid {
    pub keyspace: String,
    pub shard: String,
    pub gtid: String,
}

impl ShardGtid {
    pub fn new(
        keyspace: impl Into<String>,
        shard: impl Into<String>,
        gtid: impl Into<String>,
    ) -> Self {
        ShardGtid {
            keyspace: keyspace.into(),
            shard: shard.into(),
            gtid: gtid.into(),
        }
    }

    /// 실제 GTID 위치인지 여부 ("current"나 빈 값은 비교 대상이 아님)
    pub fn is_positional(&self) -> bool {
        !self.gtid.is_empty() && self.gtid != CURRENT_GTID
    }
}

/// 여러 샤드의 위치 집합
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vgtid {
    shard_gtids: Vec<ShardGtid>,
}

impl Vgtid {
    pub fn new(shard_gtids: Vec<ShardGtid>) -> Self {
        Vgtid { shard_gtids }
    }

    /// 새 세션용 초기 VGTID
    ///
    /// 샤드 목록이 비어 있으면 keyspace 전체를 의미하는 빈 샤드 이름 하나를 사용합니다.
    pub fn initial(keyspace: &str, shards: &[String], gtid: &str) -> Self {
        if shards.is_empty() {
            return Vgtid::new(vec![ShardGtid::new(keyspace, "", gtid)]);
        }
        Vgtid::new(
            shards
                .iter()
                .map(|shard| ShardGtid::new(keyspace, shard.as_str(), gtid))
                .collect(),
        )
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let vgtid: Vgtid = serde_json::from_str(json)?;
        if vgtid.shard_gtids.is_empty() {
            return Err(CdcError::VgtidError(format!("Empty vgtid: {}", json)));
        }
        Ok(vgtid)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.shard_gtids)?)
    }

    pub fn shard_gtids(&self) -> &[ShardGtid] {
        &self.shard_gtids
    }

    pub fn is_empty(&self) -> bool {
        self.shard_gtids.is_empty()
    }

    pub fn get(&self, keyspace: &str, shard: &str) -> Option<&ShardGtid> {
        self.shard_gtids
            .iter()
            .find(|s| s.keyspace == keyspace && s.shard == shard)
    }

    /// 한 샤드의 위치만 바꾼 사본 (없으면 추가)
    pub fn with_shard_gtid(&self, keyspace: &str, shard: &str, gtid: &str) -> Vgtid {
        let mut next = self.clone();
        match next
            .shard_gtids
            .iter_mut()
            .find(|s| s.keyspace == keyspace && s.shard == shard)
        {
            Some(existing) => existing.gtid = gtid.to_string(),
            None => next.shard_gtids.push(ShardGtid::new(keyspace, shard, gtid)),
        }
        next
    }

    /// `previous` 대비 rank가 뒤로 간 샤드 목록
    ///
    /// 위치 단조성 검사용이며, 강제하지 않고 보고만 합니다.
    pub fn regressions_from(&self, previous: &Vgtid, ranks: &dyn RankProvider) -> Vec<String> {
        let mut regressed = Vec::new();
        for current in self.shard_gtids.iter().filter(|s| s.is_positional()) {
            let Some(before) = previous
                .get(&current.keyspace, &current.shard)
                .filter(|s| s.is_positional())
            else {
                continue;
            };
            if let (Ok(now), Ok(then)) = (ranks.rank(&current.gtid), ranks.rank(&before.gtid)) {
                if now < then {
                    regressed.push(format!("{}/{}", current.keyspace, current.shard));
                }
            }
        }
        regressed
    }

    /// `other`의 모든 샤드 위치가 이 VGTID와 같거나 뒤처져 있는지 여부
    ///
    /// 재시작 위치가 이미 지나간 이벤트를 판단할 때 사용합니다.
    pub fn covers(&self, other: &Vgtid, ranks: &dyn RankProvider) -> Result<bool> {
        for theirs in other.shard_gtids.iter().filter(|s| s.is_positional()) {
            let Some(ours) = self
                .get(&theirs.keyspace, &theirs.shard)
                .filter(|s| s.is_positional())
            else {
                return Ok(false);
            };
            if ranks.rank(&ours.gtid)? < ranks.rank(&theirs.gtid)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Vgtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.shard_gtids) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "{:?}", self.shard_gtids),
        }
    }
}
