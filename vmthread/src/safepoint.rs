use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct SafepointState {
    participants: usize,
    parked: usize,
    paused: bool,
}

/// Participation side of an isolate's stop-the-world protocol.
///
/// Threads join with [`Self::enter`] and leave with [`Self::exit`]. A
/// coordinator calls [`Self::pause`], which returns once every other
/// participant sits in [`Self::poll`]; threads trying to join meanwhile sleep
/// until [`Self::resume`].
#[derive(Debug, Default)]
pub struct SafepointHandler {
    state: Mutex<SafepointState>,
    cvar: Condvar,
}

impl SafepointHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks while the isolate is paused.
    pub fn enter(&self) {
        let mut state = self.state.lock();
        while state.paused {
            self.cvar.wait(&mut state);
        }
        state.participants += 1;
    }

    pub fn exit(&self) {
        let mut state = self.state.lock();
        assert!(state.participants > 0, "safepoint participant underflow");
        state.participants -= 1;
        self.cvar.notify_all();
    }

    /// Parks the caller if a pause is in progress.
    pub fn poll(&self) {
        let mut state = self.state.lock();
        if !state.paused {
            return;
        }
        state.parked += 1;
        self.cvar.notify_all();
        while state.paused {
            self.cvar.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// Stops the world. `caller_participates` must be set when the caller
    /// itself entered the protocol, it is not waited for.
    pub fn pause(&self, caller_participates: bool) {
        let mut state = self.state.lock();
        assert!(!state.paused, "isolate is already paused");
        state.paused = true;
        log::debug!("safepoint pause requested, {} participants", state.participants);
        loop {
            let others = state.participants.saturating_sub(caller_participates as usize);
            if state.parked >= others {
                break;
            }
            self.cvar.wait(&mut state);
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        assert!(state.paused, "resume without pause");
        state.paused = false;
        self.cvar.notify_all();
        log::debug!("safepoint resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn participants(&self) -> usize {
        self.state.lock().participants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering::SeqCst},
        },
        thread,
        time::{Duration, Instant},
    };

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while !cond() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn enter_and_exit_count_participants() {
        let handler = SafepointHandler::new();
        handler.enter();
        handler.enter();
        assert_eq!(handler.participants(), 2);
        handler.exit();
        handler.exit();
        assert_eq!(handler.participants(), 0);
    }

    #[test]
    #[should_panic(expected = "safepoint participant underflow")]
    fn exit_without_enter_panics() {
        SafepointHandler::new().exit();
    }

    #[test]
    fn poll_without_pause_returns_immediately() {
        let handler = SafepointHandler::new();
        handler.enter();
        handler.poll();
        handler.exit();
    }

    #[test]
    fn enter_blocks_while_paused() {
        let handler = Arc::new(SafepointHandler::new());
        handler.pause(false);

        let entered = Arc::new(AtomicBool::new(false));
        let t = {
            let handler = handler.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                handler.enter();
                entered.store(true, SeqCst);
                handler.exit();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(SeqCst), "enter must wait for resume");

        handler.resume();
        t.join().unwrap();
        assert!(entered.load(SeqCst));
    }

    #[test]
    fn pause_waits_for_participants_to_park() {
        let handler = Arc::new(SafepointHandler::new());
        let stop = Arc::new(AtomicBool::new(false));

        let mutator = {
            let handler = handler.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                handler.enter();
                while !stop.load(SeqCst) {
                    handler.poll();
                    thread::sleep(Duration::from_millis(1));
                }
                handler.exit();
            })
        };

        assert!(wait_until(|| handler.participants() == 1));
        handler.pause(false);
        assert!(handler.is_paused());
        assert_eq!(handler.state.lock().parked, 1);

        stop.store(true, SeqCst);
        handler.resume();
        mutator.join().unwrap();
        assert_eq!(handler.participants(), 0);
    }

    #[test]
    fn participating_coordinator_does_not_wait_for_itself() {
        let handler = SafepointHandler::new();
        handler.enter();
        handler.pause(true);
        handler.resume();
        handler.exit();
    }
}
