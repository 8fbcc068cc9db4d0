//! 복제 메시지 및 변경 이벤트 데이터 구조 정의

use crate::offset::SourceInfo;
use crate::transaction::TransactionOrder;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 복제 메시지 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Begin,
    Commit,
    Ddl,
    Other,
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Begin => "BEGIN",
            Operation::Commit => "COMMIT",
            Operation::Ddl => "DDL",
            Operation::Other => "OTHER",
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

/// 모든 메시지에 공통인 헤더
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// keyspace 이름
    pub keyspace: String,
    /// 메시지를 만든 샤드
    pub shard: String,
    /// 샤드 로컬 트랜잭션 식별자 (GTID 집합 문자열)
    pub transaction_id: Option<String>,
    /// 커밋 타임스탬프
    pub commit_time: DateTime<Utc>,
}

impl MessageHeader {
    pub fn new(
        keyspace: impl Into<String>,
        shard: impl Into<String>,
        commit_time: DateTime<Utc>,
    ) -> Self {
        MessageHeader {
            keyspace: keyspace.into(),
            shard: shard.into(),
            transaction_id: None,
            commit_time,
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }
}

/// 전송 계층에서 받은 복제 메시지
///
/// 메시지당 한 번만 분류되며 이후에는 변경되지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    Begin(MessageHeader),
    Commit(MessageHeader),
    Ddl {
        header: MessageHeader,
        statement: String,
    },
    Other(MessageHeader),
    Row {
        header: MessageHeader,
        change: RowChange,
    },
}

impl ReplicationMessage {
    pub fn header(&self) -> &MessageHeader {
        match self {
            ReplicationMessage::Begin(header)
            | ReplicationMessage::Commit(header)
            | ReplicationMessage::Other(header) => header,
            ReplicationMessage::Ddl { header, .. } | ReplicationMessage::Row { header, .. } => {
                header
            }
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            ReplicationMessage::Begin(_) => Operation::Begin,
            ReplicationMessage::Commit(_) => Operation::Commit,
            ReplicationMessage::Ddl { .. } => Operation::Ddl,
            ReplicationMessage::Other(_) => Operation::Other,
            ReplicationMessage::Row { change, .. } => change.op.into(),
        }
    }

    pub fn shard(&self) -> &str {
        &self.header().shard
    }

    pub fn commit_time(&self) -> DateTime<Utc> {
        self.header().commit_time
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.header().transaction_id.as_deref()
    }

    /// BEGIN/COMMIT 여부
    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            ReplicationMessage::Begin(_) | ReplicationMessage::Commit(_)
        )
    }
}

/// 행 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl From<OperationType> for Operation {
    fn from(op: OperationType) -> Self {
        match op {
            OperationType::Insert => Operation::Insert,
            OperationType::Update => Operation::Update,
            OperationType::Delete => Operation::Delete,
        }
    }
}

/// 컬럼 하나의 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: CellValue,
}

impl Column {
    pub fn new(name: impl Into<String>, value: CellValue) -> Self {
        Column {
            name: name.into(),
            value,
        }
    }
}

/// 셀 값
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Decimal(String),
    String(String),
    Bytes(Bytes),
    DateTime(DateTime<Utc>),
    Json(serde_json::Value),
}

impl CellValue {
    /// 대략적인 페이로드 크기 (바이트)
    pub fn estimated_size(&self) -> usize {
        match self {
            CellValue::Null => 0,
            CellValue::Int64(_) | CellValue::UInt64(_) | CellValue::Double(_) => 8,
            CellValue::DateTime(_) => 12,
            CellValue::Decimal(s) | CellValue::String(s) => s.len(),
            CellValue::Bytes(b) => b.len(),
            CellValue::Json(v) => v.to_string().len(),
        }
    }
}

/// 행 단위 변경 내용
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// "keyspace.table" 형식의 원본 테이블 이름
    pub table: String,
    pub op: OperationType,
    /// 변경 전 데이터 (UPDATE/DELETE의 경우)
    pub before: Option<Vec<Column>>,
    /// 변경 후 데이터 (INSERT/UPDATE의 경우)
    pub after: Option<Vec<Column>>,
}

impl RowChange {
    pub fn insert(table: impl Into<String>, after: Vec<Column>) -> Self {
        RowChange {
            table: table.into(),
            op: OperationType::Insert,
            before: None,
            after: Some(after),
        }
    }

    pub fn update(table: impl Into<String>, before: Vec<Column>, after: Vec<Column>) -> Self {
        RowChange {
            table: table.into(),
            op: OperationType::Update,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(table: impl Into<String>, before: Vec<Column>) -> Self {
        RowChange {
            table: table.into(),
            op: OperationType::Delete,
            before: Some(before),
            after: None,
        }
    }

    pub fn estimated_size(&self) -> usize {
        let columns_size = |columns: &Option<Vec<Column>>| {
            columns
                .iter()
                .flatten()
                .map(|c| c.name.len() + c.value.estimated_size())
                .sum::<usize>()
        };
        self.table.len() + columns_size(&self.before) + columns_size(&self.after)
    }
}

/// 테이블 식별자
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub keyspace: Option<String>,
    pub table: String,
}

impl TableId {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        TableId {
            keyspace: Some(keyspace.into()),
            table: table.into(),
        }
    }

    /// "keyspace.table" 또는 "table" 파싱
    ///
    /// 비어 있거나, 세 부분 이상이거나, 빈 부분이 있으면 `None`입니다.
    pub fn parse(name: &str) -> Option<TableId> {
        let parts: Vec<&str> = name.trim().split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            [table] => Some(TableId {
                keyspace: None,
                table: table.to_string(),
            }),
            [keyspace, table] => Some(TableId::new(*keyspace, *table)),
            _ => None,
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.keyspace {
            Some(ref keyspace) => write!(f, "{}.{}", keyspace, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// BEGIN 시 디스패처로 전달되는 트랜잭션 정보
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub shard: String,
    /// 순서 메타데이터가 켜진 경우의 (epoch, rank)
    pub order: Option<TransactionOrder>,
}

/// 행 이벤트에 붙는 트랜잭션 블록
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBlock {
    pub id: String,
    /// 트랜잭션 내 전체 순번 (1부터)
    pub total_order: u64,
    /// 트랜잭션 내 테이블별 순번 (1부터)
    pub data_collection_order: u64,
    pub order: Option<TransactionOrder>,
}

/// 정규화된 변경 이벤트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub op: OperationType,
    pub table_id: TableId,
    pub before: Option<Vec<Column>>,
    pub after: Option<Vec<Column>>,
    /// 디스패치 시점의 위치 스냅샷
    pub source: SourceInfo,
    pub transaction: Option<TransactionBlock>,
    /// 이벤트 처리 시각
    pub ts: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(
        table_id: TableId,
        change: RowChange,
        source: SourceInfo,
        transaction: Option<TransactionBlock>,
    ) -> Self {
        ChangeRecord {
            op: change.op,
            table_id,
            before: change.before,
            after: change.after,
            source,
            transaction,
            ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> MessageHeader {
        MessageHeader::new("commerce", "-80", Utc::now()).with_transaction_id("MySQL56/abc:1-5")
    }

    #[test]
    fn test_table_id_parse() {
        assert_eq!(
            TableId::parse("commerce.orders"),
            Some(TableId::new("commerce", "orders"))
        );
        assert_eq!(TableId::parse("orders").unwrap().keyspace, None);
        assert_eq!(TableId::parse(""), None);
        assert_eq!(TableId::parse("a.b.c"), None);
        assert_eq!(TableId::parse("commerce."), None);
        assert_eq!(TableId::new("commerce", "orders").to_string(), "commerce.orders");
    }

    #[test]
    fn test_message_classification() {
        let begin = ReplicationMessage::Begin(header());
        assert!(begin.is_transactional());
        assert_eq!(begin.operation(), Operation::Begin);

        let row = ReplicationMessage::Row {
            header: header(),
            change: RowChange::delete(
                "commerce.orders",
                vec![Column::new("id", CellValue::Int64(1))],
            ),
        };
        assert!(!row.is_transactional());
        assert_eq!(row.operation(), Operation::Delete);
        assert_eq!(row.shard(), "-80");
        assert_eq!(row.transaction_id(), Some("MySQL56/abc:1-5"));

        let ddl = ReplicationMessage::Ddl {
            header: header(),
            statement: "ALTER TABLE orders ADD COLUMN note TEXT".to_string(),
        };
        assert_eq!(ddl.operation().as_str(), "DDL");
    }

    #[test]
    fn test_row_estimated_size() {
        let change = RowChange::insert(
            "ks.files",
            vec![
                Column::new("id", CellValue::Int64(1)),
                Column::new("body", CellValue::Bytes(Bytes::from(vec![0u8; 100]))),
            ],
        );
        // 8 (table) + 2 + 8 + 4 + 100
        assert_eq!(change.estimated_size(), 122);
    }
}
