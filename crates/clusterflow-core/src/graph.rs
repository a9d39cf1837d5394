//! Records of submitted operations and their dependency edges.

use crate::backend::{EventHandle, OpKind, OpTimestamps};
use crate::error::{ClusterFlowError, Result};
use crate::lane::LaneKind;

/// One submitted device operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    /// Completion event returned by the backend.
    pub event: EventHandle,
    /// Owning lane.
    pub lane: LaneKind,
    /// Operation kind.
    pub kind: OpKind,
    /// Events this operation waited on.
    pub predecessors: Vec<EventHandle>,
    /// Device-clock span, filled after the drain.
    pub timestamps: Option<OpTimestamps>,
}

/// Every operation of one engine run, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationGraph {
    records: Vec<OperationRecord>,
}

impl OperationGraph {
    /// Empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: OperationRecord) {
        self.records.push(record);
    }

    /// All records in submission order.
    #[must_use]
    pub fn records(&self) -> &[OperationRecord] {
        &self.records
    }

    pub(crate) fn records_mut(&mut self) -> &mut [OperationRecord] {
        &mut self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was submitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The record of `kind` in `lane`.
    #[must_use]
    pub fn find(&self, lane: LaneKind, kind: OpKind) -> Option<&OperationRecord> {
        self.records
            .iter()
            .find(|r| r.lane == lane && r.kind == kind)
    }

    /// Records owned by `lane`, in submission order.
    pub fn records_for(&self, lane: LaneKind) -> impl Iterator<Item = &OperationRecord> {
        self.records.iter().filter(move |r| r.lane == lane)
    }

    /// Completed timestamps of the record of `kind` in `lane`.
    pub fn timestamps(&self, lane: LaneKind, kind: OpKind) -> Result<OpTimestamps> {
        self.find(lane, kind)
            .and_then(|r| r.timestamps)
            .ok_or(ClusterFlowError::TimingUnavailable { lane, op: kind })
    }

    /// Check that each lane forms the chain
    /// `TRANSFER_IN -> COMPUTE_START -> COMPUTE_END -> TRANSFER_OUT`
    /// and that no edge crosses lanes.
    pub fn check_shape(&self) -> Result<()> {
        let lanes: Vec<LaneKind> = {
            let mut seen = Vec::new();
            for r in &self.records {
                if !seen.contains(&r.lane) {
                    seen.push(r.lane);
                }
            }
            seen
        };

        for lane in lanes {
            let ops: Vec<&OperationRecord> = self.records_for(lane).collect();
            if ops.len() != OpKind::ALL.len() {
                return Err(ClusterFlowError::InvalidGraph(format!(
                    "{} lane has {} operations",
                    lane,
                    ops.len()
                )));
            }
            for kind in OpKind::ALL {
                let record = self
                    .find(lane, kind)
                    .ok_or_else(|| missing_op(lane, kind))?;
                let expected: Vec<EventHandle> = match kind.predecessor() {
                    None => Vec::new(),
                    Some(pred) => {
                        let pred = self
                            .find(lane, pred)
                            .ok_or_else(|| missing_op(lane, pred))?;
                        vec![pred.event]
                    }
                };
                if record.predecessors != expected {
                    return Err(ClusterFlowError::InvalidGraph(format!(
                        "{} {} waits on {:?}, expected {:?}",
                        lane, kind, record.predecessors, expected
                    )));
                }
            }
        }
        Ok(())
    }
}

fn missing_op(lane: LaneKind, kind: OpKind) -> ClusterFlowError {
    ClusterFlowError::InvalidGraph(format!("{} lane has no {}", lane, kind))
}
