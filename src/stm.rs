//! Generic state machine runtime shared by the SOCKS engine and the
//! management plane.
//!
//! A state is a small integer (`u8`). Each state carries optional callbacks:
//! arrival, read-ready, write-ready, block-ready and departure. The table is
//! fixed at construction time and indexed directly by state value, mirroring
//! the `state_definition` dispatch table in the reference C implementation
//! this crate's SOCKS engine is modeled on.
//!
//! One deliberate departure from a literal reading of arrival-has-no-return:
//! `on_arrival` here returns the state it wants to be in, same as the other
//! callbacks. Returning its own state is a no-op arrival, matching the
//! traditional signature; returning something else chains straight into
//! another transition. This is what lets a state whose entire job can
//! finish synchronously — e.g. address-fallback exhausting every candidate
//! without ever seeing `EINPROGRESS` — move on without waiting for an I/O
//! event that will never come.

use crate::selector::Key;

/// One row of the state table.
pub struct StateDef<C> {
    pub on_arrival: Option<fn(prev: u8, conn: &mut C, key: &Key) -> u8>,
    pub on_read_ready: Option<fn(conn: &mut C, key: &Key) -> u8>,
    pub on_write_ready: Option<fn(conn: &mut C, key: &Key) -> u8>,
    pub on_block_ready: Option<fn(conn: &mut C, key: &Key) -> u8>,
    pub on_departure: Option<fn(next: u8, conn: &mut C, key: &Key)>,
}

impl<C> Default for StateDef<C> {
    fn default() -> Self {
        StateDef {
            on_arrival: None,
            on_read_ready: None,
            on_write_ready: None,
            on_block_ready: None,
            on_departure: None,
        }
    }
}

/// Drives a connection (or management session) through a fixed table of
/// states. `C` is the per-connection scratch record the callbacks mutate.
pub struct Stm<C> {
    table: Vec<StateDef<C>>,
    current: u8,
    initial: u8,
}

const MAX_CHAINED_ARRIVALS: u32 = 32;

impl<C> Stm<C> {
    /// `table[i]` must be the definition for state `i`; `initial` is the
    /// starting state and must be a valid index.
    pub fn new(table: Vec<StateDef<C>>, initial: u8) -> Stm<C> {
        assert!((initial as usize) < table.len(), "initial state out of range");
        Stm {
            table,
            current: initial,
            initial,
        }
    }

    pub fn max_state(&self) -> u8 {
        (self.table.len() - 1) as u8
    }

    pub fn initial(&self) -> u8 {
        self.initial
    }

    pub fn state(&self) -> u8 {
        self.current
    }

    fn def(&self, state: u8) -> &StateDef<C> {
        &self.table[state as usize]
    }

    /// Runs arrival for the initial state. Call once after construction,
    /// before the first `handle_*`.
    pub fn start(&mut self, conn: &mut C, key: &Key) {
        let initial = self.initial;
        self.run_arrival(initial, initial, conn, key, 0);
    }

    fn run_arrival(&mut self, state: u8, prev: u8, conn: &mut C, key: &Key, depth: u32) {
        debug_assert!(depth < MAX_CHAINED_ARRIVALS, "arrival chain did not converge");
        if let Some(f) = self.def(state).on_arrival {
            let next = f(prev, conn, key);
            if next != state && depth < MAX_CHAINED_ARRIVALS {
                self.transition_inner(next, conn, key, depth + 1);
            }
        }
    }

    /// Forces a transition regardless of what the current callback return
    /// value was — used to drive a connection into `ERROR` from a close
    /// event the state table itself never produces a transition for.
    pub fn force(&mut self, next: u8, conn: &mut C, key: &Key) {
        self.transition_inner(next, conn, key, 0);
    }

    fn transition_inner(&mut self, next: u8, conn: &mut C, key: &Key, depth: u32) {
        if next == self.current {
            return;
        }
        if let Some(f) = self.def(self.current).on_departure {
            f(next, conn, key);
        }
        let prev = self.current;
        self.current = next;
        self.run_arrival(next, prev, conn, key, depth);
    }

    fn transition(&mut self, next: u8, conn: &mut C, key: &Key) {
        self.transition_inner(next, conn, key, 0);
    }

    pub fn handle_read(&mut self, conn: &mut C, key: &Key) {
        if let Some(f) = self.def(self.current).on_read_ready {
            let next = f(conn, key);
            self.transition(next, conn, key);
        }
    }

    pub fn handle_write(&mut self, conn: &mut C, key: &Key) {
        if let Some(f) = self.def(self.current).on_write_ready {
            let next = f(conn, key);
            self.transition(next, conn, key);
        }
    }

    pub fn handle_block(&mut self, conn: &mut C, key: &Key) {
        if let Some(f) = self.def(self.current).on_block_ready {
            let next = f(conn, key);
            self.transition(next, conn, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;

    struct Counter {
        arrivals: u32,
        departures: u32,
    }

    fn with_key<F: FnOnce(&Key)>(f: F) {
        let sel = Selector::new(4).expect("selector");
        let key = Key {
            selector: &sel,
            fd: -1,
            token: crate::selector::Token(0),
        };
        f(&key);
    }

    #[test]
    fn self_transition_skips_arrival_departure() {
        with_key(|key| {
            let table = vec![
                StateDef {
                    on_arrival: Some(|_prev, c: &mut Counter, _k| {
                        c.arrivals += 1;
                        0
                    }),
                    on_read_ready: Some(|_c, _k| 0),
                    on_departure: Some(|_next, c: &mut Counter, _k| c.departures += 1),
                    ..Default::default()
                },
                StateDef::default(),
            ];
            let mut stm = Stm::new(table, 0);
            let mut conn = Counter { arrivals: 0, departures: 0 };
            stm.start(&mut conn, key);
            assert_eq!(conn.arrivals, 1);
            stm.handle_read(&mut conn, key);
            assert_eq!(stm.state(), 0);
            assert_eq!(conn.arrivals, 1);
            assert_eq!(conn.departures, 0);
        });
    }

    #[test]
    fn transition_runs_departure_then_arrival() {
        with_key(|key| {
            let table = vec![
                StateDef {
                    on_arrival: Some(|_prev, c: &mut Counter, _k| {
                        c.arrivals += 1;
                        0
                    }),
                    on_read_ready: Some(|_c, _k| 1),
                    on_departure: Some(|_next, c: &mut Counter, _k| c.departures += 1),
                    ..Default::default()
                },
                StateDef {
                    on_arrival: Some(|_prev, c: &mut Counter, _k| {
                        c.arrivals += 1;
                        1
                    }),
                    ..Default::default()
                },
            ];
            let mut stm = Stm::new(table, 0);
            let mut conn = Counter { arrivals: 0, departures: 0 };
            stm.start(&mut conn, key);
            stm.handle_read(&mut conn, key);
            assert_eq!(stm.state(), 1);
            assert_eq!(conn.arrivals, 2);
            assert_eq!(conn.departures, 1);
        });
    }

    #[test]
    fn arrival_can_chain_into_another_transition() {
        with_key(|key| {
            let table = vec![
                StateDef {
                    on_read_ready: Some(|_c, _k| 1),
                    ..Default::default()
                },
                StateDef {
                    // state 1's arrival immediately bounces to state 2
                    // without ever waiting on an I/O event.
                    on_arrival: Some(|_prev, c: &mut Counter, _k| {
                        c.arrivals += 1;
                        2
                    }),
                    ..Default::default()
                },
                StateDef {
                    on_arrival: Some(|_prev, c: &mut Counter, _k| {
                        c.arrivals += 1;
                        2
                    }),
                    ..Default::default()
                },
            ];
            let mut stm = Stm::new(table, 0);
            let mut conn = Counter { arrivals: 0, departures: 0 };
            stm.handle_read(&mut conn, key);
            assert_eq!(stm.state(), 2);
            assert_eq!(conn.arrivals, 2);
        });
    }
}
