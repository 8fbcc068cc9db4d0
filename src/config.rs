//! 커넥터 설정

use crate::error::{CdcError, Result};
use crate::vgtid::{Vgtid, CURRENT_GTID};
use regex::Regex;
use std::env;
use std::time::Duration;

/// 스트리밍 세션 설정
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// 논리 소스 이름 (파티션 식별자)
    pub server_name: String,
    pub keyspace: String,
    /// 구독할 샤드 목록 (비어 있으면 keyspace 전체)
    pub shards: Vec<String>,
    /// 새 세션의 샤드별 시작 GTID
    pub gtid: String,
    /// 에러/중단 신호 확인 간격
    pub poll_interval: Duration,
    /// BEGIN 이벤트에 (epoch, rank) 순서 메타데이터 포함 여부
    pub provide_ordered_transaction_metadata: bool,
    /// 큰 행 경고 임계값 (바이트)
    pub large_row_threshold_bytes: usize,
    /// 큰 행 경고 대상 테이블 정규식 (없으면 모든 테이블)
    pub large_row_table_pattern: Option<String>,
    /// 디스패치 채널 용량
    pub dispatch_channel_capacity: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            server_name: "vitess".to_string(),
            keyspace: "commerce".to_string(),
            shards: Vec::new(),
            gtid: CURRENT_GTID.to_string(),
            poll_interval: Duration::from_millis(500),
            provide_ordered_transaction_metadata: false,
            large_row_threshold_bytes: 10 * 1000,
            large_row_table_pattern: None,
            dispatch_channel_capacity: 1024,
        }
    }
}

impl ConnectorConfig {
    pub fn new(server_name: impl Into<String>, keyspace: impl Into<String>) -> Self {
        ConnectorConfig {
            server_name: server_name.into(),
            keyspace: keyspace.into(),
            ..Default::default()
        }
    }

    /// 환경 변수에서 설정 읽기 (없는 값은 기본값)
    pub fn from_env() -> Result<Self> {
        let defaults = ConnectorConfig::default();

        let config = ConnectorConfig {
            server_name: env::var("VITESS_SERVER_NAME").unwrap_or(defaults.server_name),
            keyspace: env::var("VITESS_KEYSPACE").unwrap_or(defaults.keyspace),
            shards: env::var("VITESS_SHARDS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.shards),
            gtid: env::var("VITESS_GTID").unwrap_or(defaults.gtid),
            poll_interval: match env::var("VITESS_POLL_INTERVAL_MS") {
                Ok(ms) => Duration::from_millis(parse_env("VITESS_POLL_INTERVAL_MS", &ms)?),
                Err(_) => defaults.poll_interval,
            },
            provide_ordered_transaction_metadata: match env::var("VITESS_ORDERED_TX_METADATA") {
                Ok(flag) => parse_env("VITESS_ORDERED_TX_METADATA", &flag)?,
                Err(_) => defaults.provide_ordered_transaction_metadata,
            },
            large_row_threshold_bytes: match env::var("VITESS_LARGE_ROW_BYTES") {
                Ok(bytes) => parse_env("VITESS_LARGE_ROW_BYTES", &bytes)?,
                Err(_) => defaults.large_row_threshold_bytes,
            },
            large_row_table_pattern: env::var("VITESS_LARGE_ROW_TABLE_PATTERN").ok(),
            dispatch_channel_capacity: defaults.dispatch_channel_capacity,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_name.trim().is_empty() {
            return Err(CdcError::ConfigError("server_name must not be empty".to_string()));
        }
        if self.keyspace.trim().is_empty() {
            return Err(CdcError::ConfigError("keyspace must not be empty".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(CdcError::ConfigError("poll_interval must be positive".to_string()));
        }
        if self.dispatch_channel_capacity == 0 {
            return Err(CdcError::ConfigError(
                "dispatch_channel_capacity must be positive".to_string(),
            ));
        }
        if let Some(ref pattern) = self.large_row_table_pattern {
            Regex::new(pattern).map_err(|e| {
                CdcError::ConfigError(format!("Invalid large row table pattern {}: {}", pattern, e))
            })?;
        }
        Ok(())
    }

    /// 새 세션의 시작 VGTID
    pub fn initial_vgtid(&self) -> Vgtid {
        Vgtid::initial(&self.keyspace, &self.shards, &self.gtid)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CdcError::ConfigError(format!("Invalid value for {}: {}", name, value)))
}
