use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type ViewerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerPhase {
    Connecting,
    Initialized,
    Ready,
}

impl ViewerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewerPhase::Connecting => "connecting",
            ViewerPhase::Initialized => "loading",
            ViewerPhase::Ready => "ready",
        }
    }
}

/// Where a dispatched change came from, which decides whether the host
/// player applies it and which viewer is left out of the broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Observed on the host player: broadcast only.
    Host,
    /// Sent by a viewer: apply on the host, broadcast to everyone else.
    Viewer(ViewerId),
    /// Decided by the hub itself: apply on the host, broadcast to everyone.
    Hub,
}

impl Origin {
    pub fn applies_locally(&self) -> bool {
        !matches!(self, Origin::Host)
    }

    pub fn excluded(&self) -> Option<ViewerId> {
        match self {
            Origin::Viewer(id) => Some(*id),
            Origin::Host | Origin::Hub => None,
        }
    }
}

#[derive(Debug)]
pub struct Viewer {
    pub id: ViewerId,
    pub addr: SocketAddr,
    pub alive: bool,
    pub phase: ViewerPhase,
    pub connected_at: Instant,
    /// `Ready`s still owed for `Init`s that a reload superseded.
    stale_readies: u32,
    outbox: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub viewer_id: ViewerId,
    pub pause_host: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired {
    pub phase: ViewerPhase,
    pub gate_opened: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    Accepted { gate_opened: bool },
    /// Answers an `Init` sent before the last media change.
    Stale,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ViewerInfo {
    pub viewer_id: ViewerId,
    pub addr: SocketAddr,
    pub phase: ViewerPhase,
    pub connected_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub title: String,
    pub paused: bool,
    pub alive_count: usize,
    pub pending_ready: usize,
    pub total_count: usize,
    pub packets_broadcast: u64,
    pub viewers: Vec<ViewerInfo>,
}

/// Viewer records plus the synchronization counters, mutated as one unit.
///
/// Records are never removed, so a viewer's id is its index for the lifetime
/// of the process. `pending_ready` counts alive viewers that have not sent
/// `Ready` since their last `Init`; it never exceeds `alive_count`.
#[derive(Debug)]
pub struct ViewerRegistry {
    viewers: Vec<Viewer>,
    title: String,
    paused: bool,
    pending_ready: usize,
    alive_count: usize,
    resume_pending: bool,
    packets_broadcast: u64,
}

impl ViewerRegistry {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            viewers: Vec::new(),
            title: title.into(),
            paused: false,
            pending_ready: 0,
            alive_count: 0,
            resume_pending: false,
            packets_broadcast: 0,
        }
    }

    pub fn admit(
        &mut self,
        addr: SocketAddr,
        outbox: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Admission {
        let viewer_id = self.viewers.len() as ViewerId;
        self.viewers.push(Viewer {
            id: viewer_id,
            addr,
            alive: true,
            phase: ViewerPhase::Connecting,
            connected_at: Instant::now(),
            stale_readies: 0,
            outbox,
            cancel,
        });
        self.alive_count += 1;

        let pause_host = self.pending_ready == 0 && !self.paused;
        if pause_host {
            self.resume_pending = true;
            self.paused = true;
        }
        self.pending_ready += 1;
        self.check_invariant();

        Admission {
            viewer_id,
            pause_host,
        }
    }

    /// Makes a joining viewer eligible for broadcasts. Returns false if it
    /// was retired meanwhile.
    pub fn mark_initialized(&mut self, id: ViewerId) -> bool {
        match self.alive_mut(id) {
            Some(viewer) => {
                if viewer.phase == ViewerPhase::Connecting {
                    viewer.phase = ViewerPhase::Initialized;
                }
                true
            }
            None => false,
        }
    }

    pub fn mark_ready(&mut self, id: ViewerId) -> ReadyOutcome {
        let Some(viewer) = self.alive_mut(id) else {
            return ReadyOutcome::Ignored;
        };
        if viewer.phase != ViewerPhase::Initialized {
            return ReadyOutcome::Ignored;
        }
        if viewer.stale_readies > 0 {
            viewer.stale_readies -= 1;
            return ReadyOutcome::Stale;
        }
        viewer.phase = ViewerPhase::Ready;

        self.pending_ready -= 1;
        let gate_opened = self.take_gate();
        self.check_invariant();
        ReadyOutcome::Accepted { gate_opened }
    }

    /// Marks a viewer dead and closes its connection. Only the first call
    /// for a viewer has any effect.
    pub fn retire(&mut self, id: ViewerId) -> Option<Retired> {
        let viewer = self.alive_mut(id)?;
        viewer.alive = false;
        viewer.cancel.cancel();
        let phase = viewer.phase;

        self.alive_count -= 1;
        if phase != ViewerPhase::Ready {
            self.pending_ready -= 1;
        }
        let gate_opened = self.take_gate();
        self.check_invariant();

        Some(Retired { phase, gate_opened })
    }

    /// Queues `raw` for every alive, initialized viewer except `except`.
    /// Returns the viewers whose queue was full or closed.
    pub fn broadcast(&mut self, except: Option<ViewerId>, raw: &Bytes) -> Vec<ViewerId> {
        let mut failed = Vec::new();
        for viewer in &self.viewers {
            if !viewer.alive || viewer.phase == ViewerPhase::Connecting {
                continue;
            }
            if Some(viewer.id) == except {
                continue;
            }
            match viewer.outbox.try_send(raw.clone()) {
                Ok(()) => self.packets_broadcast += 1,
                Err(_) => failed.push(viewer.id),
            }
        }
        failed
    }

    /// Restarts the join protocol for every live viewer after a media change.
    ///
    /// A resume still pending from an unfinished join carries over. Viewers
    /// that were still loading owe one more `Ready` for the superseded `Init`.
    pub fn restart_join(&mut self, title: impl Into<String>, resume_after: bool) {
        self.title = title.into();
        self.pending_ready = self.alive_count;
        self.resume_pending = (resume_after || self.resume_pending) && self.alive_count > 0;
        for viewer in self.viewers.iter_mut().filter(|v| v.alive) {
            match viewer.phase {
                ViewerPhase::Ready => viewer.phase = ViewerPhase::Initialized,
                ViewerPhase::Initialized => viewer.stale_readies += 1,
                ViewerPhase::Connecting => {}
            }
        }
        self.check_invariant();
    }

    pub fn retire_all(&mut self) -> Vec<ViewerId> {
        let ids: Vec<ViewerId> = self.iter_alive().map(|v| v.id).collect();
        for id in &ids {
            self.retire(*id);
        }
        self.resume_pending = false;
        ids
    }

    fn take_gate(&mut self) -> bool {
        if self.pending_ready == 0 && self.resume_pending {
            self.resume_pending = false;
            true
        } else {
            false
        }
    }

    fn alive_mut(&mut self, id: ViewerId) -> Option<&mut Viewer> {
        self.viewers
            .get_mut(id as usize)
            .filter(|viewer| viewer.alive)
    }

    fn check_invariant(&self) {
        debug_assert!(
            self.pending_ready <= self.alive_count,
            "pending_ready {} exceeds alive_count {}",
            self.pending_ready,
            self.alive_count
        );
    }

    pub fn get(&self, id: ViewerId) -> Option<&Viewer> {
        self.viewers.get(id as usize)
    }

    pub fn iter_alive(&self) -> impl Iterator<Item = &Viewer> {
        self.viewers.iter().filter(|v| v.alive)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn pending_ready(&self) -> usize {
        self.pending_ready
    }

    pub fn alive_count(&self) -> usize {
        self.alive_count
    }

    pub fn total_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn resume_pending(&self) -> bool {
        self.resume_pending
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            title: self.title.clone(),
            paused: self.paused,
            alive_count: self.alive_count,
            pending_ready: self.pending_ready,
            total_count: self.viewers.len(),
            packets_broadcast: self.packets_broadcast,
            viewers: self
                .iter_alive()
                .map(|v| ViewerInfo {
                    viewer_id: v.id,
                    addr: v.addr,
                    phase: v.phase,
                    connected_secs: v.connected_at.elapsed().as_secs(),
                })
                .collect(),
        }
    }
}
