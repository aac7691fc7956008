use std::net::SocketAddr;

use anyhow::Context;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;

use crate::session::{Completion, Request, Session};

/// Owns one worker's sessions. Establishes them with a bounded number of
/// connect attempts in flight and routes each roundtrip to a uniformly
/// random session, which avoids systematic alignment between the pacer tick
/// and any one session's busy state.
pub struct Dispatcher {
    sessions: Vec<Session>,
    rng: SmallRng,
    peak_connects: usize,
}

impl Dispatcher {
    pub fn new(endpoints: &[SocketAddr]) -> Self {
        Self {
            sessions: endpoints.iter().copied().map(Session::new).collect(),
            rng: SmallRng::from_entropy(),
            peak_connects: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// High-water mark of simultaneously outstanding connect attempts seen
    /// during `connect_all`.
    pub fn peak_connects(&self) -> usize {
        self.peak_connects
    }

    /// Connect every session, walking from the highest index down and
    /// keeping at most `budget` attempts outstanding so a large session
    /// count does not stampede the listener backlog. Resolves once all
    /// sessions are connected; the first failure aborts the walk.
    pub async fn connect_all(
        &mut self,
        budget: usize,
        done: &UnboundedSender<Completion>,
    ) -> anyhow::Result<()> {
        // A zero budget would launch nothing and resolve immediately with
        // every session still unconnected; it floors at one attempt.
        let budget = budget.max(1);
        let mut next = self.sessions.len();
        let mut attempts = JoinSet::new();
        loop {
            while next > 0 && attempts.len() < budget {
                next -= 1;
                let index = next;
                let peer = self.sessions[index].peer();
                attempts.spawn(async move { (index, TcpStream::connect(peer).await) });
            }
            self.peak_connects = self.peak_connects.max(attempts.len());
            let Some(joined) = attempts.join_next().await else {
                return Ok(());
            };
            let (index, result) = joined.context("connect task failed")?;
            let peer = self.sessions[index].peer();
            let stream = result.with_context(|| format!("connect {peer}"))?;
            self.sessions[index]
                .start(stream, done.clone())
                .with_context(|| format!("configure {peer}"))?;
        }
    }

    /// Forward one roundtrip to a random session.
    pub fn roundtrip(&mut self, request: Request) {
        let index = self.rng.gen_range(0..self.sessions.len());
        self.sessions[index].roundtrip(request);
    }
}
