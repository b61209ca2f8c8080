use std::future::Future;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Automatic session transitions driven by timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    Intermission,
    Resume,
    End,
}

/// Identifies one arming of a [`TimerSlot`]. A fired timer must present the
/// ticket it was armed with; anything else is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub transition: Transition,
    generation: u64,
}

struct Armed {
    ticket: Ticket,
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// At most one pending transition for a session.
#[derive(Default)]
pub struct TimerSlot {
    generation: u64,
    armed: Option<Armed>,
}

impl TimerSlot {
    /// Replaces whatever was armed with `transition` at `deadline`. `fire` runs
    /// on its own task once the deadline passes.
    pub fn arm<F, Fut>(&mut self, transition: Transition, deadline: Instant, fire: F) -> Ticket
    where
        F: FnOnce(Ticket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let ticket = Ticket {
            transition,
            generation: self.generation,
        };
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            fire(ticket).await;
        });
        self.armed = Some(Armed {
            ticket,
            deadline,
            handle,
        });
        ticket
    }

    /// Aborts the armed timer, if any.
    pub fn cancel(&mut self) -> Option<Transition> {
        self.armed.take().map(|armed| {
            armed.handle.abort();
            armed.ticket.transition
        })
    }

    /// Called from a firing timer. Disarms the slot and returns true only if
    /// `ticket` is the one currently armed. Does not abort the caller's task.
    pub fn claim(&mut self, ticket: Ticket) -> bool {
        match &self.armed {
            Some(armed) if armed.ticket == ticket => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self) -> Option<(Transition, Instant)> {
        self.armed
            .as_ref()
            .map(|armed| (armed.ticket.transition, armed.deadline))
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    type Fired = Arc<Mutex<Vec<Ticket>>>;

    fn recorder(fired: &Fired) -> impl FnOnce(Ticket) -> std::future::Ready<()> + Send + 'static {
        let fired = fired.clone();
        move |ticket| {
            fired.lock().unwrap().push(ticket);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_deadline() {
        let fired = Fired::default();
        let mut slot = TimerSlot::default();
        let deadline = Instant::now() + Duration::from_secs(60);
        let ticket = slot.arm(Transition::Intermission, deadline, recorder(&fired));
        assert_eq!(slot.pending(), Some((Transition::Intermission, deadline)));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(fired.lock().unwrap().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*fired.lock().unwrap(), vec![ticket]);
        assert!(slot.claim(ticket));
        assert_eq!(slot.pending(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_previous_timer() {
        let fired = Fired::default();
        let mut slot = TimerSlot::default();
        let first = slot.arm(
            Transition::Intermission,
            Instant::now() + Duration::from_secs(10),
            recorder(&fired),
        );
        let second = slot.arm(
            Transition::End,
            Instant::now() + Duration::from_secs(20),
            recorder(&fired),
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*fired.lock().unwrap(), vec![second]);
        assert!(!slot.claim(first));
        assert!(slot.claim(second));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let fired = Fired::default();
        let mut slot = TimerSlot::default();
        slot.arm(
            Transition::Resume,
            Instant::now() + Duration::from_secs(5),
            recorder(&fired),
        );
        assert_eq!(slot.cancel(), Some(Transition::Resume));
        assert_eq!(slot.cancel(), None);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fired.lock().unwrap().is_empty());
    }
}
