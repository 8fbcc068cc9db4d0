//! GTID (Global Transaction ID) 집합 관리
//!
//! Vitess 샤드 위치 형식: `flavor/uuid:interval[:interval...][,uuid:interval...]`
//! 예: "MySQL56/16b1039f-22b6-11ed-b765-0a43f95f28a3:1-615,7a2e0e4c-22b6-11ed-b765-0a43f95f28a3:1-3"
//!
//! 하나의 샤드가 실행한 트랜잭션 집합을 나타내며, 샤드의 실행 집합은 커밋이 진행될수록 커지기만 합니다.

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// GTID 범위 (sequence 범위, 양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(CdcError::InvalidIdentifier(format!(
                "Invalid range: {}-{}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        // 겹치거나 연접한 범위만 병합
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// 호스트(서버 UUID)별 GTID 범위들
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostGtidSet {
    pub uuid: String,
    pub ranges: Vec<GtidRange>,
}

impl HostGtidSet {
    pub fn new(uuid: String) -> Self {
        HostGtidSet {
            uuid,
            ranges: Vec::new(),
        }
    }

    /// 범위 추가 후 정렬 및 병합
    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) => match last.merge(&range) {
                    Some(m) => *last = m,
                    None => merged.push(range),
                },
                None => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(sequence))
    }

    /// 이 호스트에서 실행된 가장 큰 sequence 번호
    pub fn max_sequence(&self) -> Option<u64> {
        self.ranges.iter().map(|r| r.end).max()
    }
}

impl fmt::Display for HostGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)?;
        for range in &self.ranges {
            write!(f, ":{}", range)?;
        }
        Ok(())
    }
}

/// 전체 GTID 집합 (여러 호스트)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    /// 복제 flavor (e.g., "MySQL56")
    pub flavor: Option<String>,
    pub sets: BTreeMap<String, HostGtidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet::default()
    }

    /// GTID 문자열 파싱
    ///
    /// 빈 문자열과 "NULL"은 빈 집합으로 취급합니다.
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let gtid_str = gtid_str.trim();
        let mut gtid_set = GtidSet::new();

        if gtid_str.is_empty() || gtid_str == "NULL" {
            return Ok(gtid_set);
        }

        let body = match gtid_str.split_once('/') {
            Some((flavor, body)) => {
                if flavor.is_empty() {
                    return Err(CdcError::InvalidIdentifier(format!(
                        "Empty flavor in GTID: {}",
                        gtid_str
                    )));
                }
                gtid_set.flavor = Some(flavor.to_string());
                body
            }
            None => gtid_str,
        };

        for host_part in body.split(',') {
            let host_part = host_part.trim();
            let mut pieces = host_part.split(':');
            let uuid = pieces.next().unwrap_or_default().trim();
            if uuid.is_empty() {
                return Err(CdcError::InvalidIdentifier(format!(
                    "Missing host id in GTID: {}",
                    gtid_str
                )));
            }

            let mut host = gtid_set
                .sets
                .remove(uuid)
                .unwrap_or_else(|| HostGtidSet::new(uuid.to_string()));

            let mut interval_count = 0;
            for interval in pieces {
                host.add_range(parse_interval(interval)?);
                interval_count += 1;
            }
            if interval_count == 0 {
                return Err(CdcError::InvalidIdentifier(format!(
                    "No intervals for host {} in GTID: {}",
                    uuid, gtid_str
                )));
            }

            gtid_set.sets.insert(uuid.to_string(), host);
        }

        Ok(gtid_set)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }

    /// 호스트별 최대 sequence 번호 목록 (rank 계산에 사용)
    pub fn sequence_values(&self) -> Vec<u64> {
        self.sets
            .values()
            .filter_map(HostGtidSet::max_sequence)
            .collect()
    }

    pub fn contains(&self, uuid: &str, sequence: u64) -> bool {
        self.sets
            .get(uuid)
            .map(|set| set.contains(sequence))
            .unwrap_or(false)
    }

    pub fn is_host_set_equal(&self, other: &GtidSet) -> bool {
        self.sets.len() == other.sets.len() && self.is_host_set_superset_of(other)
    }

    pub fn is_host_set_superset_of(&self, other: &GtidSet) -> bool {
        other.sets.keys().all(|uuid| self.sets.contains_key(uuid))
    }
}

impl FromStr for GtidSet {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        GtidSet::parse(s)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref flavor) = self.flavor {
            write!(f, "{}/", flavor)?;
        }
        let parts: Vec<String> = self
            .sets
            .values()
            .filter(|set| !set.ranges.is_empty())
            .map(|set| set.to_string())
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

/// "1-100" 또는 "42" 형식의 구간 파싱
fn parse_interval(interval: &str) -> Result<GtidRange> {
    let interval = interval.trim();
    let parse_seq = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| CdcError::InvalidIdentifier(format!("Invalid sequence: {}", interval)))
    };

    match interval.split_once('-') {
        Some((start, end)) => GtidRange::new(parse_seq(start)?, parse_seq(end)?),
        None => {
            let seq = parse_seq(interval)?;
            GtidRange::new(seq, seq)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_A: &str = "16b1039f-22b6-11ed-b765-0a43f95f28a3";
    const HOST_B: &str = "7a2e0e4c-22b6-11ed-b765-0a43f95f28a3";

    #[test]
    fn test_gtid_parse_vitess_position() {
        let gtid_str = format!("MySQL56/{}:1-615,{}:1-3", HOST_A, HOST_B);
        let gtid_set = GtidSet::parse(&gtid_str).unwrap();

        assert_eq!(gtid_set.flavor.as_deref(), Some("MySQL56"));
        assert_eq!(gtid_set.sets.len(), 2);
        assert!(gtid_set.contains(HOST_A, 615));
        assert!(!gtid_set.contains(HOST_A, 616));
        assert_eq!(gtid_set.to_string(), gtid_str);
    }

    #[test]
    fn test_gtid_parse_multiple_intervals() {
        let gtid_set = GtidSet::parse(&format!("{}:1-5:6-10:20", HOST_A)).unwrap();
        let host = &gtid_set.sets[HOST_A];
        assert_eq!(host.ranges.len(), 2);
        assert_eq!(host.max_sequence(), Some(20));
        assert_eq!(gtid_set.flavor, None);
    }

    #[test]
    fn test_gtid_parse_rejects_malformed() {
        assert!(GtidSet::parse("MySQL56/:1-5").is_err());
        assert!(GtidSet::parse(&format!("MySQL56/{}:9-1", HOST_A)).is_err());
        assert!(GtidSet::parse(&format!("MySQL56/{}:abc", HOST_A)).is_err());
        assert!(GtidSet::parse(&format!("MySQL56/{}", HOST_A)).is_err());
        assert!(GtidSet::parse("/abc:1").is_err());
    }

    #[test]
    fn test_gtid_empty() {
        assert!(GtidSet::parse("").unwrap().is_empty());
        assert!(GtidSet::parse("NULL").unwrap().is_empty());
    }

    #[test]
    fn test_sequence_values() {
        let gtid_set = GtidSet::parse(&format!("MySQL56/{}:1-615,{}:1-3", HOST_A, HOST_B)).unwrap();
        let mut values = gtid_set.sequence_values();
        values.sort();
        assert_eq!(values, vec![3, 615]);
    }

    #[test]
    fn test_host_set_relations() {
        let one = GtidSet::parse(&format!("MySQL56/{}:1-10", HOST_A)).unwrap();
        let two = GtidSet::parse(&format!("MySQL56/{}:1-12,{}:1-2", HOST_A, HOST_B)).unwrap();

        assert!(two.is_host_set_superset_of(&one));
        assert!(!one.is_host_set_superset_of(&two));
        assert!(!one.is_host_set_equal(&two));
        assert!(one.is_host_set_equal(&GtidSet::parse(&format!("{}:1-99", HOST_A)).unwrap()));
    }

    #[test]
    fn test_range_merge() {
        let a = GtidRange::new(1, 5).unwrap();
        let b = GtidRange::new(6, 9).unwrap();
        let c = GtidRange::new(11, 12).unwrap();
        assert_eq!(a.merge(&b), Some(GtidRange::new(1, 9).unwrap()));
        assert_eq!(a.merge(&c), None);
    }
}
