//! 트랜잭션 rank 계산
//!
//! 샤드 로컬 트랜잭션 식별자(GTID 집합)를 전순서가 있는 숫자로 변환합니다.
//! 서로 다른 샤드의 트랜잭션을 샤드별 지식 없이 비교할 수 있게 해주는 경계입니다.

use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// 트랜잭션 rank
///
/// 호스트별 sequence 합이므로 u64 합산 결과를 u128로 담습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransactionRank(u128);

impl TransactionRank {
    pub fn new(value: u128) -> Self {
        TransactionRank(value)
    }

    pub fn value(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for TransactionRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// JSON 소비자의 정수 정밀도 한계를 피하기 위해 10진 문자열로 직렬화
impl Serialize for TransactionRank {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TransactionRank {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u128>()
            .map(TransactionRank)
            .map_err(serde::de::Error::custom)
    }
}

/// 트랜잭션 식별자 → rank 매핑
///
/// 구현은 순수 함수여야 합니다: 같은 입력은 항상 같은 rank를 내고,
/// 같은 샤드에서 먼저 커밋된 트랜잭션은 더 작은 rank를 가져야 합니다.
pub trait RankProvider: Send + Sync {
    fn rank(&self, transaction_id: &str) -> Result<TransactionRank>;
}

/// Vitess GTID 기반 rank: 호스트별 최대 sequence 번호의 합
#[derive(Debug, Clone, Copy, Default)]
pub struct VitessRankProvider;

impl RankProvider for VitessRankProvider {
    fn rank(&self, transaction_id: &str) -> Result<TransactionRank> {
        let gtid_set = GtidSet::parse(transaction_id)?;
        if gtid_set.is_empty() {
            return Err(CdcError::InvalidIdentifier(format!(
                "Empty transaction id: '{}'",
                transaction_id
            )));
        }

        let rank = gtid_set
            .sequence_values()
            .into_iter()
            .fold(0u128, |acc, seq| acc + u128::from(seq));

        Ok(TransactionRank(rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_A: &str = "16b1039f-22b6-11ed-b765-0a43f95f28a3";
    const HOST_B: &str = "7a2e0e4c-22b6-11ed-b765-0a43f95f28a3";

    #[test]
    fn test_rank_sums_host_sequences() {
        let provider = VitessRankProvider;
        let rank = provider
            .rank(&format!("MySQL56/{}:1-615,{}:1-3", HOST_A, HOST_B))
            .unwrap();
        assert_eq!(rank, TransactionRank::new(618));
    }

    #[test]
    fn test_rank_follows_shard_commit_order() {
        let provider = VitessRankProvider;
        let ids: Vec<String> = (100..110)
            .map(|seq| format!("MySQL56/{}:1-{},{}:1-7", HOST_A, seq, HOST_B))
            .collect();

        let ranks: Vec<TransactionRank> = ids.iter().map(|id| provider.rank(id).unwrap()).collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_rank_is_deterministic() {
        let provider = VitessRankProvider;
        let id = format!("MySQL56/{}:1-42", HOST_A);
        assert_eq!(provider.rank(&id).unwrap(), provider.rank(&id).unwrap());
    }

    #[test]
    fn test_rank_does_not_overflow_u64() {
        let provider = VitessRankProvider;
        let id = format!("MySQL56/{}:{},{}:{}", HOST_A, u64::MAX, HOST_B, u64::MAX);
        let rank = provider.rank(&id).unwrap();
        assert_eq!(rank.value(), u128::from(u64::MAX) * 2);
    }

    #[test]
    fn test_rank_rejects_malformed_identifier() {
        let provider = VitessRankProvider;
        assert!(matches!(
            provider.rank("not-a-gtid"),
            Err(CdcError::InvalidIdentifier(_))
        ));
        assert!(matches!(provider.rank(""), Err(CdcError::InvalidIdentifier(_))));
    }

    #[test]
    fn test_rank_serializes_as_string() {
        let json = serde_json::to_string(&TransactionRank::new(618)).unwrap();
        assert_eq!(json, "\"618\"");
        let back: TransactionRank = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TransactionRank::new(618));
    }
}
