//! Vitess VStream CDC (Change Data Capture) 스트리밍 핵심 구현
//!
//! 이 라이브러리는 Vitess 복제 스트림을 받아 위치를 추적하고 변경 이벤트를 디스패치합니다.
//! 주요 기능:
//! - GTID 기반 트랜잭션 rank 계산
//! - VGTID 위치 모델 (재시작 가능한 오프셋)
//! - 트랜잭션 경계 처리 및 변경 이벤트 디스패치
//! - 스트리밍 세션 감독 및 에러 전파

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gtid;
pub mod observer;
pub mod offset;
pub mod rank;
pub mod streaming;
pub mod transaction;
pub mod vgtid;

pub use config::ConnectorConfig;
pub use connection::{ChannelReplicationConnection, ReplicationConnection, ReplicationEvent};
pub use dispatcher::{ChannelDispatcher, DispatchedEvent, EventDispatcher};
pub use error::{CdcError, Result};
pub use events::{ChangeRecord, ReplicationMessage, RowChange, TableId};
pub use gtid::GtidSet;
pub use offset::{OffsetContext, Partition, SourceInfo, StoredOffset};
pub use rank::{RankProvider, TransactionRank, VitessRankProvider};
pub use streaming::{SessionEnd, StreamingChangeEventSource};
pub use vgtid::Vgtid;
