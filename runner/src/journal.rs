pub mod timeline;

use crate::protocol::WorkerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

pub use timeline::{Bar, Milestone, Timeline};

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("{lane} has an odd number of {kind} delimiters")]
    Odd { lane: Lane, kind: EventKind },
    #[error("{lane}: expected the end of {expected}, found {found:?} of {kind}")]
    Unmatched {
        lane: Lane,
        expected: EventKind,
        kind: EventKind,
        found: Boundary,
    },
    #[error("{lane}: {kind} ended before it began")]
    Orphaned { lane: Lane, kind: EventKind },
    #[error("Failed to write timeline")]
    IO(#[from] std::io::Error),
    #[error("Failed to serialize timeline")]
    Serialize(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Communication,
    Aggregation,
    Setup,
    Assignment,
    AggregationOccurred,
    DataReady,
    CloseDown,
}

impl EventKind {
    pub fn is_milestone(&self) -> bool {
        matches!(
            self,
            Self::AggregationOccurred | Self::DataReady | Self::CloseDown
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Communication => "communication",
            Self::Aggregation => "aggregation",
            Self::Setup => "setup",
            Self::Assignment => "assignment",
            Self::AggregationOccurred => "aggregation occurred",
            Self::DataReady => "data ready",
            Self::CloseDown => "close down",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Begin,
    End,
    Instant,
}

/// One row of the timeline, the master or a single worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lane {
    pub role: Role,
    pub worker: Option<WorkerId>,
}

impl Lane {
    pub fn master() -> Self {
        Self {
            role: Role::Master,
            worker: None,
        }
    }

    pub fn worker(worker: WorkerId) -> Self {
        Self {
            role: Role::Worker,
            worker: Some(worker),
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.role, self.worker) {
            (Role::Master, _) => f.write_str("master"),
            (Role::Worker, Some(worker)) => write!(f, "{worker}"),
            (Role::Worker, None) => f.write_str("unknown worker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEvent {
    pub lane: Lane,
    pub kind: EventKind,
    pub boundary: Boundary,
    pub timestamp: DateTime<Utc>,
    // sequence number of the task the event belongs to
    pub correlation: Option<u64>,
}

/// Append-only record of what happened when, never consulted for scheduling
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Vec<JournalEvent>,
    correlation: Option<u64>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// tag every following event with `correlation`
    pub fn set_correlation(&mut self, correlation: Option<u64>) {
        self.correlation = correlation;
    }

    pub fn record(&mut self, lane: Lane, kind: EventKind, boundary: Boundary, timestamp: DateTime<Utc>) {
        self.events.push(JournalEvent {
            lane,
            kind,
            boundary,
            timestamp,
            correlation: self.correlation,
        });
    }

    pub fn begin(&mut self, lane: Lane, kind: EventKind, timestamp: DateTime<Utc>) {
        self.record(lane, kind, Boundary::Begin, timestamp);
    }

    pub fn end(&mut self, lane: Lane, kind: EventKind, timestamp: DateTime<Utc>) {
        self.record(lane, kind, Boundary::End, timestamp);
    }

    pub fn milestone(&mut self, lane: Lane, kind: EventKind, timestamp: DateTime<Utc>) {
        self.record(lane, kind, Boundary::Instant, timestamp);
    }

    pub fn events(&self) -> &[JournalEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// match every begin with its end per lane
    pub fn timeline(&self) -> Result<Timeline, JournalError> {
        let mut lanes: BTreeMap<Lane, Vec<&JournalEvent>> = BTreeMap::new();
        let mut milestones = Vec::new();

        for event in self.events.iter() {
            match event.boundary {
                Boundary::Instant => milestones.push(Milestone {
                    lane: event.lane,
                    kind: event.kind,
                    at: event.timestamp,
                    correlation: event.correlation,
                }),
                Boundary::Begin | Boundary::End => {
                    lanes.entry(event.lane).or_default().push(event)
                }
            }
        }

        let mut bars = Vec::new();
        for (lane, mut events) in lanes {
            // stable, so delimiters sharing a timestamp keep their recording order
            events.sort_by_key(|event| event.timestamp);

            if events.len() % 2 != 0 {
                return Err(JournalError::Odd {
                    lane,
                    kind: events[events.len() - 1].kind,
                });
            }

            for pair in events.chunks(2) {
                let (begin, end) = (pair[0], pair[1]);

                if begin.boundary != Boundary::Begin {
                    return Err(JournalError::Orphaned {
                        lane,
                        kind: begin.kind,
                    });
                }
                if end.boundary != Boundary::End || end.kind != begin.kind {
                    return Err(JournalError::Unmatched {
                        lane,
                        expected: begin.kind,
                        kind: end.kind,
                        found: end.boundary,
                    });
                }

                bars.push(Bar {
                    lane,
                    kind: begin.kind,
                    begin: begin.timestamp,
                    end: end.timestamp,
                    correlation: begin.correlation,
                });
            }
        }

        milestones.sort_by_key(|milestone| milestone.at);

        Ok(Timeline { bars, milestones })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + Duration::milliseconds(millis)
    }

    #[test]
    fn matched_pairs_become_bars() {
        let mut journal = Journal::new();
        journal.set_correlation(Some(1));
        let worker = Lane::worker(WorkerId(2));

        // recorded out of order, the assignment end arrives with the report
        journal.begin(Lane::master(), EventKind::Setup, at(0));
        journal.end(Lane::master(), EventKind::Setup, at(10));
        journal.end(worker, EventKind::Assignment, at(50));
        journal.begin(worker, EventKind::Assignment, at(20));
        journal.milestone(Lane::master(), EventKind::AggregationOccurred, at(60));
        journal.milestone(worker, EventKind::DataReady, at(30));

        let timeline = journal.timeline().unwrap();

        assert_eq!(timeline.bars.len(), 2);
        let assignment = timeline
            .bars
            .iter()
            .find(|bar| bar.kind == EventKind::Assignment)
            .unwrap();
        assert_eq!(assignment.lane, worker);
        assert_eq!(assignment.begin, at(20));
        assert_eq!(assignment.end, at(50));
        assert_eq!(assignment.correlation, Some(1));
        assert_eq!(
            timeline.milestones.iter().map(|m| m.kind).collect::<Vec<_>>(),
            vec![EventKind::DataReady, EventKind::AggregationOccurred]
        );
    }

    #[test]
    fn odd_delimiters_are_fatal() {
        let mut journal = Journal::new();
        journal.begin(Lane::master(), EventKind::Aggregation, at(0));
        journal.end(Lane::master(), EventKind::Aggregation, at(5));
        journal.begin(Lane::master(), EventKind::Communication, at(6));

        assert!(matches!(
            journal.timeline(),
            Err(JournalError::Odd {
                kind: EventKind::Communication,
                ..
            })
        ));
    }

    #[test]
    fn wrong_closing_kind_is_fatal() {
        let mut journal = Journal::new();
        journal.begin(Lane::master(), EventKind::Aggregation, at(0));
        journal.end(Lane::master(), EventKind::Communication, at(5));

        assert!(matches!(
            journal.timeline(),
            Err(JournalError::Unmatched {
                expected: EventKind::Aggregation,
                kind: EventKind::Communication,
                ..
            })
        ));
    }

    #[test]
    fn end_before_begin_is_fatal() {
        let mut journal = Journal::new();
        let lane = Lane::worker(WorkerId(0));
        journal.end(lane, EventKind::Assignment, at(0));
        journal.begin(lane, EventKind::Assignment, at(5));

        assert!(matches!(
            journal.timeline(),
            Err(JournalError::Orphaned { .. })
        ));
    }

    #[test]
    fn lanes_are_matched_independently() {
        let mut journal = Journal::new();
        // interleaved across workers but consistent per worker
        journal.begin(Lane::worker(WorkerId(0)), EventKind::Assignment, at(0));
        journal.begin(Lane::worker(WorkerId(1)), EventKind::Assignment, at(1));
        journal.end(Lane::worker(WorkerId(0)), EventKind::Assignment, at(2));
        journal.end(Lane::worker(WorkerId(1)), EventKind::Assignment, at(3));

        assert_eq!(journal.timeline().unwrap().bars.len(), 2);
    }
}
