use tokio::sync::mpsc;

use crate::clock::WallClock;
use crate::dispatcher::Dispatcher;
use crate::pacer::Pacer;
use crate::payload::Payload;
use crate::session::Request;

/// One per worker. Connects the dispatcher's sessions, then issues
/// roundtrips on a drift-free schedule: a wall-clock cursor advances by the
/// pacer's interval per request, and the reactor only sleeps when the cursor
/// is ahead of real time. If the reactor falls behind, the backlog is issued
/// immediately on the next pass.
pub struct Driver {
    clock: WallClock,
    dispatcher: Dispatcher,
    pacer: Pacer,
    payload: Payload,
    bulk_connect: usize,
}

impl Driver {
    pub fn new(
        clock: WallClock,
        dispatcher: Dispatcher,
        pacer: Pacer,
        payload: Payload,
        bulk_connect: usize,
    ) -> Self {
        Self {
            clock,
            dispatcher,
            pacer,
            payload,
            bulk_connect,
        }
    }

    /// Run until the process is terminated. Returns only on a startup
    /// failure; established-session errors abort the process directly.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let (done, mut completions) = mpsc::unbounded_channel();
        self.dispatcher.connect_all(self.bulk_connect, &done).await?;

        let mut next_due = self.clock.now();
        loop {
            let horizon = self.clock.now();
            while next_due <= horizon {
                self.dispatcher.roundtrip(Request {
                    block: self.payload.block(),
                    started: horizon,
                });
                next_due += self.pacer.initiated(horizon);
            }

            let deadline = tokio::time::Instant::from_std(self.clock.instant_at(next_due));
            let timer = tokio::time::sleep_until(deadline);
            tokio::pin!(timer);
            loop {
                tokio::select! {
                    _ = &mut timer => break,
                    completion = completions.recv() => {
                        let Some(completion) = completion else { break };
                        let now = self.clock.now();
                        self.pacer.completed(now, now - completion.started);
                    }
                }
            }
        }
    }
}
