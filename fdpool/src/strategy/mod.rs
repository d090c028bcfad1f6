pub mod hash;
pub mod random_cycle;
pub mod sequential;

use random_cycle::RandomCycle;
use sequential::SequentialCycle;

/// Reason a caller is asking for the next node to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Brand new connection attempt, no prior node to penalize.
    Start,
    /// The previous node was entirely unreachable.
    Fail,
    /// The previous node reported a transient failure (e.g. overloaded).
    TempFail,
}

/// Selection algorithm for a service's node set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Sequential,
    RandomCycle,
    /// Deterministic weighted pick from a client hash, falling back to
    /// random cycling on retry.
    ClientHash,
}

#[derive(Clone, Copy)]
struct Weight {
    cost: u32,
    tempfail_cost: u32,
}

/// Holds the weight table for a service's current node set. Temp-fail cost
/// inflation lives here so it persists across connections until cleared.
pub struct WeightTable {
    weights: Vec<Weight>,
    pub retries: u32,
    pub failcost: u32,
    pub softfailcost: u32,
    pub strategy: Strategy,
}

impl WeightTable {
    pub fn new(costs: &[u32], retries: u32, failcost: u32, softfailcost: u32, strategy: Strategy) -> Self {
        Self {
            weights: costs
                .iter()
                .map(|&cost| Weight {
                    cost: cost.max(1),
                    tempfail_cost: 0,
                })
                .collect(),
            retries,
            failcost,
            softfailcost,
            strategy,
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    fn costs(&self) -> Vec<u32> {
        self.weights.iter().map(|w| w.cost).collect()
    }

    fn tempfail_costs(&self) -> Vec<u32> {
        self.weights.iter().map(|w| w.tempfail_cost).collect()
    }
}

enum CycleState {
    Sequential(SequentialCycle),
    Random(RandomCycle),
    /// First pick is the deterministic weighted index; everything after a
    /// failure falls back to a random cycle, matching the upstream note
    /// that client hashing only holds for the first, unpenalized attempt.
    Hash { first_pick: Option<u32>, random: Option<RandomCycle> },
}

/// Per-connection iteration cursor. One is created per logical connection
/// attempt via [`WeightTable::new_conn`] and advanced with [`ConnCursor::next`]
/// each time a node needs to be retried.
pub struct ConnCursor {
    hash: u32,
    state: CycleState,
    retries_left: i64,
    remaining_in_round: i64,
    last_index: Option<usize>,
}

impl WeightTable {
    pub fn new_conn(&self, hash: u32) -> ConnCursor {
        let mut cursor = ConnCursor {
            hash,
            state: match self.strategy {
                Strategy::Sequential => CycleState::Sequential(SequentialCycle::default()),
                Strategy::RandomCycle => CycleState::Random(RandomCycle::new(
                    self.len().max(1) as u32,
                    rand::random(),
                )),
                Strategy::ClientHash => CycleState::Hash {
                    first_pick: None,
                    random: None,
                },
            },
            retries_left: self.retries as i64,
            remaining_in_round: 0,
            last_index: None,
        };
        self.reinit(&mut cursor);
        cursor
    }

    fn reinit(&self, cursor: &mut ConnCursor) {
        // Hash's first round is a single deterministic pick; every later
        // round (after a fail) cycles randomly across all nodes.
        let round_len = match &mut cursor.state {
            CycleState::Sequential(c) => {
                c.reset();
                self.len()
            }
            CycleState::Random(c) => {
                *c = RandomCycle::new(self.len().max(1) as u32, rand::random());
                self.len()
            }
            CycleState::Hash { first_pick, random } => {
                if first_pick.is_none() && random.is_none() {
                    let pick = hash::weighted_pick(&self.costs(), &self.tempfail_costs(), cursor.hash);
                    *first_pick = Some(pick as u32);
                    1
                } else {
                    *first_pick = None;
                    *random = Some(RandomCycle::new(self.len().max(1) as u32, rand::random()));
                    self.len()
                }
            }
        };
        cursor.remaining_in_round = round_len as i64;
    }
}

impl ConnCursor {
    /// Returns the index of the next node to try, or `None` once retries are
    /// exhausted. Penalizes the previously returned index according to
    /// `status` before advancing.
    pub fn next(&mut self, table: &mut WeightTable, status: ConnStatus) -> Option<usize> {
        if table.is_empty() {
            return None;
        }

        if let Some(last) = self.last_index {
            if status != ConnStatus::Start {
                let penalty = if status == ConnStatus::Fail {
                    table.failcost
                } else {
                    table.softfailcost
                };
                table.weights[last].tempfail_cost = penalty;
            }
        }

        if self.remaining_in_round == 0 {
            if self.retries_left == 0 {
                return None;
            }
            self.retries_left -= 1;
            table.reinit(self);
        }
        self.remaining_in_round -= 1;

        let idx = match &mut self.state {
            CycleState::Sequential(c) => c.next() as usize,
            CycleState::Random(c) => c.next() as usize,
            CycleState::Hash { first_pick, random } => {
                if let Some(p) = first_pick.take() {
                    p as usize
                } else {
                    random.as_mut().expect("hash cursor reinitialized").next() as usize
                }
            }
        };
        let idx = idx.min(table.len() - 1);
        self.last_index = Some(idx);
        Some(idx)
    }

    /// Call once a connection attempt succeeds, clearing any temp-fail
    /// penalty previously recorded against the node it landed on.
    pub fn done(&self, table: &mut WeightTable) {
        if let Some(last) = self.last_index {
            if self.retries_left >= 0 {
                table.weights[last].tempfail_cost = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_cycles_through_all_nodes_before_giving_up() {
        let mut table = WeightTable::new(&[1, 1, 1], 1, 100, 0, Strategy::Sequential);
        let mut cursor = table.new_conn(0);
        let mut seen = Vec::new();
        while let Some(idx) = cursor.next(&mut table, if seen.is_empty() { ConnStatus::Start } else { ConnStatus::Fail }) {
            seen.push(idx);
        }
        // 1 initial round + 1 retry round = 6 attempts across 3 nodes.
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn empty_table_never_yields_a_node() {
        let mut table = WeightTable::new(&[], 3, 100, 0, Strategy::Sequential);
        let mut cursor = table.new_conn(0);
        assert_eq!(cursor.next(&mut table, ConnStatus::Start), None);
    }

    #[test]
    fn fail_status_inflates_tempfail_cost_of_last_node() {
        let mut table = WeightTable::new(&[1, 1], 2, 50, 0, Strategy::Sequential);
        let mut cursor = table.new_conn(0);
        let first = cursor.next(&mut table, ConnStatus::Start).unwrap();
        cursor.next(&mut table, ConnStatus::Fail);
        assert_eq!(table.weights[first].tempfail_cost, 50);
    }

    #[test]
    fn done_clears_tempfail_cost_on_success() {
        let mut table = WeightTable::new(&[1, 1], 2, 50, 0, Strategy::Sequential);
        let mut cursor = table.new_conn(0);
        let first = cursor.next(&mut table, ConnStatus::Start).unwrap();
        table.weights[first].tempfail_cost = 50;
        cursor.last_index = Some(first);
        cursor.done(&mut table);
        assert_eq!(table.weights[first].tempfail_cost, 0);
    }

    #[test]
    fn client_hash_is_deterministic_on_first_pick() {
        let table = WeightTable::new(&[1, 1, 1, 1], 0, 100, 0, Strategy::ClientHash);
        let mut a = table.new_conn(0xdead_beef);
        let mut b = table.new_conn(0xdead_beef);
        let mut ta = WeightTable::new(&[1, 1, 1, 1], 0, 100, 0, Strategy::ClientHash);
        let mut tb = WeightTable::new(&[1, 1, 1, 1], 0, 100, 0, Strategy::ClientHash);
        assert_eq!(
            a.next(&mut ta, ConnStatus::Start),
            b.next(&mut tb, ConnStatus::Start)
        );
    }
}
