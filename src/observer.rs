//! 디스패치 후 관찰 훅
//!
//! 진단용 계측(큰 행 경고 등)은 처리 경로가 아니라 디스패치 성공 뒤에 호출되는 훅으로 둡니다.

use crate::config::ConnectorConfig;
use crate::error::{CdcError, Result};
use crate::events::TableId;
use regex::Regex;
use tracing::{debug, warn};

/// 디스패치에 성공한 행의 요약
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedRow {
    pub table_id: TableId,
    pub shard: String,
    pub payload_bytes: usize,
}

pub trait DispatchObserver: Send + Sync {
    fn on_data_change_dispatched(&self, row: &DispatchedRow);
}

type TablePredicate = Box<dyn Fn(&TableId) -> bool + Send + Sync>;

/// 특정 테이블의 큰 행을 경고로 남기는 관찰자
pub struct LargeRowObserver {
    predicate: TablePredicate,
    threshold_bytes: usize,
}

impl LargeRowObserver {
    pub fn new(
        threshold_bytes: usize,
        predicate: impl Fn(&TableId) -> bool + Send + Sync + 'static,
    ) -> Self {
        LargeRowObserver {
            predicate: Box::new(predicate),
            threshold_bytes,
        }
    }

    /// 모든 테이블 대상
    pub fn all_tables(threshold_bytes: usize) -> Self {
        LargeRowObserver::new(threshold_bytes, |_| true)
    }

    /// 테이블 이름("keyspace.table")이 정규식과 맞는 경우만 대상
    pub fn matching_tables(threshold_bytes: usize, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            CdcError::ConfigError(format!("Invalid table pattern {}: {}", pattern, e))
        })?;
        Ok(LargeRowObserver::new(threshold_bytes, move |table| {
            regex.is_match(&table.to_string())
        }))
    }

    pub fn from_config(config: &ConnectorConfig) -> Result<Self> {
        match config.large_row_table_pattern {
            Some(ref pattern) => {
                LargeRowObserver::matching_tables(config.large_row_threshold_bytes, pattern)
            }
            None => Ok(LargeRowObserver::all_tables(config.large_row_threshold_bytes)),
        }
    }

    pub fn is_large(&self, row: &DispatchedRow) -> bool {
        (self.predicate)(&row.table_id) && row.payload_bytes > self.threshold_bytes
    }
}

impl DispatchObserver for LargeRowObserver {
    fn on_data_change_dispatched(&self, row: &DispatchedRow) {
        if !(self.predicate)(&row.table_id) {
            return;
        }
        if row.payload_bytes > self.threshold_bytes {
            warn!(
                "Large row change for {} on shard {}: {} bytes (threshold {})",
                row.table_id, row.shard, row.payload_bytes, self.threshold_bytes
            );
        } else {
            debug!(
                "Row change for {} on shard {}: {} bytes",
                row.table_id, row.shard, row.payload_bytes
            );
        }
    }
}

impl std::fmt::Debug for LargeRowObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeRowObserver")
            .field("threshold_bytes", &self.threshold_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(table: &str, bytes: usize) -> DispatchedRow {
        DispatchedRow {
            table_id: TableId::parse(table).unwrap(),
            shard: "-80".to_string(),
            payload_bytes: bytes,
        }
    }

    #[test]
    fn test_threshold() {
        let observer = LargeRowObserver::all_tables(100);
        assert!(!observer.is_large(&row("ks.orders", 100)));
        assert!(observer.is_large(&row("ks.orders", 101)));
    }

    #[test]
    fn test_table_pattern() {
        let observer = LargeRowObserver::matching_tables(10, "files").unwrap();
        assert!(observer.is_large(&row("ks.user_files", 11)));
        assert!(!observer.is_large(&row("ks.orders", 11)));
        observer.on_data_change_dispatched(&row("ks.user_files", 11));
    }

    #[test]
    fn test_custom_predicate() {
        let observer = LargeRowObserver::new(0, |table| table.keyspace.as_deref() == Some("blob"));
        assert!(observer.is_large(&row("blob.t", 1)));
        assert!(!observer.is_large(&row("ks.t", 1)));
    }

    #[test]
    fn test_from_config() {
        let mut config = ConnectorConfig::default();
        config.large_row_threshold_bytes = 5;
        config.large_row_table_pattern = Some("^commerce\\.".to_string());
        let observer = LargeRowObserver::from_config(&config).unwrap();
        assert!(observer.is_large(&row("commerce.orders", 6)));
        assert!(!observer.is_large(&row("customer.orders", 6)));

        config.large_row_table_pattern = Some("[".to_string());
        assert!(LargeRowObserver::from_config(&config).is_err());
    }
}
