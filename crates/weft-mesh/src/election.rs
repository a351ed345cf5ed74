use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use weft_core::Candidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    Idle,
    /// A primary was lost; the grace timer is running before a new round.
    Waiting,
    /// A round is open and candidates are being gathered.
    Collecting,
    Decided,
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub round_timeout: Duration,
    pub primary_loss_grace: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(3),
            primary_loss_grace: Duration::from_secs(5),
        }
    }
}

/// Side effects the coordinator asks the node to perform. The coordinator
/// itself never touches the network or the device table.
#[derive(Debug, Clone)]
pub enum ElectionEffect {
    BroadcastStart,
    BroadcastCandidate(Candidate),
    BroadcastResult { primary_id: String, reason: String },
    Decided { primary_id: String, is_local: bool },
}

struct ElectionInner {
    phase: ElectionPhase,
    primary_id: Option<String>,
    candidates: HashMap<String, Candidate>,
    started_at: Option<Instant>,
    round_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
}

/// Decides the single primary from the currently-known online devices.
///
/// Ranking is a strict total order (user-designated beats not, longer uptime
/// beats shorter, the lexicographically smallest device id breaks what
/// remains), so every device that saw the same candidate set decides the
/// same winner.
pub struct ElectionCoordinator {
    device_id: String,
    user_designated: bool,
    config: ElectionConfig,
    inner: Mutex<ElectionInner>,
    effects_tx: mpsc::Sender<ElectionEffect>,
}

/// Pick the winner from a candidate set, or `None` if it is empty.
pub fn rank_candidates(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates
        .iter()
        .reduce(|best, c| if beats(c, best) { c } else { best })
}

fn beats(a: &Candidate, b: &Candidate) -> bool {
    if a.user_designated != b.user_designated {
        return a.user_designated;
    }
    if a.uptime != b.uptime {
        return a.uptime > b.uptime;
    }
    a.device_id < b.device_id
}

impl ElectionCoordinator {
    pub fn new(
        device_id: impl Into<String>,
        user_designated: bool,
        config: ElectionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ElectionEffect>) {
        let (effects_tx, effects_rx) = mpsc::channel(64);
        let coordinator = Arc::new(Self {
            device_id: device_id.into(),
            user_designated,
            config,
            inner: Mutex::new(ElectionInner {
                phase: ElectionPhase::Idle,
                primary_id: None,
                candidates: HashMap::new(),
                started_at: None,
                round_timer: None,
                grace_timer: None,
            }),
            effects_tx,
        });
        (coordinator, effects_rx)
    }

    /// Record when the local node came up; uptime in candidacies is measured
    /// from here.
    pub fn mark_started(&self) {
        self.inner.lock().started_at = Some(Instant::now());
    }

    pub fn phase(&self) -> ElectionPhase {
        self.inner.lock().phase
    }

    pub fn primary_id(&self) -> Option<String> {
        self.inner.lock().primary_id.clone()
    }

    pub fn is_local_primary(&self) -> bool {
        self.inner.lock().primary_id.as_deref() == Some(self.device_id.as_str())
    }

    // ── Triggers ───────────────────────────────────────────────

    /// No primary known at startup: open a round immediately.
    pub fn handle_no_primary_on_startup(self: &Arc<Self>) {
        self.start_round();
    }

    /// The primary went away. Wait out the grace period (it may come right
    /// back or another result may arrive), then open a round.
    pub fn handle_primary_lost(self: &Arc<Self>, prev_primary: &str) {
        info!(prev_primary, "primary lost, arming grace timer");
        let coordinator = Arc::clone(self);
        let grace = self.config.primary_loss_grace;
        let mut inner = self.inner.lock();
        inner.phase = ElectionPhase::Waiting;
        inner.primary_id = None;
        Self::cancel_timers(&mut inner);
        inner.grace_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_waiting = {
                let mut inner = coordinator.inner.lock();
                inner.grace_timer = None;
                inner.phase == ElectionPhase::Waiting
            };
            if still_waiting {
                coordinator.start_round();
            }
        }));
    }

    /// A peer opened a round. Join it unless we are already collecting.
    pub fn handle_election_start(self: &Arc<Self>, from: &str) {
        let already_collecting = self.inner.lock().phase == ElectionPhase::Collecting;
        if already_collecting {
            debug!(from, "election already collecting, ignoring start");
            return;
        }
        debug!(from, "joining election round");
        self.start_round();
    }

    /// A candidacy arrived; newest entry per device wins.
    pub fn handle_candidate(&self, candidate: Candidate) {
        let mut inner = self.inner.lock();
        if inner.phase != ElectionPhase::Collecting {
            debug!(
                candidate = %candidate.device_id,
                phase = ?inner.phase,
                "candidate outside a round, ignoring"
            );
            return;
        }
        inner
            .candidates
            .insert(candidate.device_id.clone(), candidate);
    }

    /// Any `election:result` is adopted immediately — it doubles as the
    /// acknowledgement and lets an established primary seed a late joiner
    /// without a fresh round.
    pub fn handle_result(self: &Arc<Self>, primary_id: &str) {
        let effect = {
            let mut inner = self.inner.lock();
            Self::cancel_timers(&mut inner);
            inner.candidates.clear();
            inner.phase = ElectionPhase::Decided;
            let changed = inner.primary_id.as_deref() != Some(primary_id);
            inner.primary_id = Some(primary_id.to_string());
            changed
        };
        if effect {
            info!(primary = primary_id, "adopting election result");
            self.emit(ElectionEffect::Decided {
                primary_id: primary_id.to_string(),
                is_local: primary_id == self.device_id,
            });
        }
    }

    /// Silent adoption from a `device:list` snapshot — the table already
    /// realigned roles, so no effect is emitted.
    pub fn set_primary(&self, primary_id: Option<String>) {
        let mut inner = self.inner.lock();
        match primary_id {
            Some(primary_id) => {
                Self::cancel_timers(&mut inner);
                inner.candidates.clear();
                inner.phase = ElectionPhase::Decided;
                inner.primary_id = Some(primary_id);
            }
            None => {
                inner.primary_id = None;
            }
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        Self::cancel_timers(&mut inner);
        inner.candidates.clear();
        inner.primary_id = None;
        inner.phase = ElectionPhase::Idle;
        inner.started_at = None;
    }

    // ── Round protocol ─────────────────────────────────────────

    fn start_round(self: &Arc<Self>) {
        let own = {
            let mut inner = self.inner.lock();
            Self::cancel_timers(&mut inner);
            inner.phase = ElectionPhase::Collecting;
            inner.candidates.clear();
            let own = Candidate {
                device_id: self.device_id.clone(),
                uptime: inner
                    .started_at
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(0),
                user_designated: self.user_designated,
            };
            inner.candidates.insert(own.device_id.clone(), own.clone());

            let coordinator = Arc::clone(self);
            let timeout = self.config.round_timeout;
            inner.round_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                coordinator.decide();
            }));
            own
        };
        info!(uptime_ms = own.uptime, "election round opened");
        self.emit(ElectionEffect::BroadcastStart);
        self.emit(ElectionEffect::BroadcastCandidate(own));
    }

    fn decide(self: &Arc<Self>) {
        let (winner, is_local) = {
            let mut inner = self.inner.lock();
            if inner.phase != ElectionPhase::Collecting {
                return;
            }
            inner.round_timer = None;
            let candidates: Vec<Candidate> = inner.candidates.values().cloned().collect();
            // An empty set can only happen when a device races a round with
            // itself; defaulting to the local device prevents livelock.
            let winner = rank_candidates(&candidates)
                .map(|c| c.device_id.clone())
                .unwrap_or_else(|| self.device_id.clone());
            inner.phase = ElectionPhase::Decided;
            inner.primary_id = Some(winner.clone());
            inner.candidates.clear();
            let is_local = winner == self.device_id;
            (winner, is_local)
        };
        info!(primary = %winner, is_local, "election decided");
        if is_local {
            self.emit(ElectionEffect::BroadcastResult {
                primary_id: winner.clone(),
                reason: "election".into(),
            });
        }
        self.emit(ElectionEffect::Decided {
            primary_id: winner,
            is_local,
        });
    }

    fn cancel_timers(inner: &mut ElectionInner) {
        if let Some(timer) = inner.round_timer.take() {
            timer.abort();
        }
        if let Some(timer) = inner.grace_timer.take() {
            timer.abort();
        }
    }

    fn emit(&self, effect: ElectionEffect) {
        if self.effects_tx.try_send(effect).is_err() {
            warn!("election effect buffer full, dropping effect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, uptime: u64, designated: bool) -> Candidate {
        Candidate {
            device_id: id.into(),
            uptime,
            user_designated: designated,
        }
    }

    // ── Ranking ────────────────────────────────────────────────

    #[test]
    fn longer_uptime_wins() {
        let set = [candidate("dev-a", 120_000, false), candidate("dev-b", 30_000, false)];
        assert_eq!(rank_candidates(&set).unwrap().device_id, "dev-a");
    }

    #[test]
    fn user_designated_overrides_uptime() {
        let set = [candidate("dev-a", 10_000, true), candidate("dev-b", 120_000, false)];
        assert_eq!(rank_candidates(&set).unwrap().device_id, "dev-a");
    }

    #[test]
    fn lexicographic_tiebreak() {
        let set = [candidate("dev-1", 60_000, false), candidate("aaa", 60_000, false)];
        assert_eq!(rank_candidates(&set).unwrap().device_id, "aaa");
    }

    #[test]
    fn ranking_is_order_independent() {
        let mut set = vec![
            candidate("dev-1", 60_000, false),
            candidate("aaa", 60_000, false),
            candidate("zzz", 90_000, false),
            candidate("mid", 90_000, true),
        ];
        let winner = rank_candidates(&set).unwrap().device_id.clone();
        set.reverse();
        assert_eq!(rank_candidates(&set).unwrap().device_id, winner);
        assert_eq!(winner, "mid");
    }

    // ── Rounds ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn remote_with_longer_uptime_wins_round() {
        let (coordinator, mut effects) =
            ElectionCoordinator::new("dev-b", false, ElectionConfig::default());
        coordinator.mark_started();

        coordinator.handle_no_primary_on_startup();
        assert_eq!(coordinator.phase(), ElectionPhase::Collecting);
        assert!(matches!(
            effects.recv().await.unwrap(),
            ElectionEffect::BroadcastStart
        ));
        assert!(matches!(
            effects.recv().await.unwrap(),
            ElectionEffect::BroadcastCandidate(_)
        ));

        coordinator.handle_candidate(candidate("dev-a", 120_000, false));

        tokio::time::sleep(Duration::from_secs(4)).await;
        match effects.recv().await.unwrap() {
            ElectionEffect::Decided {
                primary_id,
                is_local,
            } => {
                assert_eq!(primary_id, "dev-a");
                assert!(!is_local);
            }
            other => panic!("expected Decided, got {other:?}"),
        }
        assert_eq!(coordinator.phase(), ElectionPhase::Decided);
        assert!(!coordinator.is_local_primary());
    }

    #[tokio::test(start_paused = true)]
    async fn lone_device_elects_itself_and_broadcasts_result() {
        let (coordinator, mut effects) =
            ElectionCoordinator::new("dev-a", false, ElectionConfig::default());
        coordinator.mark_started();
        coordinator.handle_no_primary_on_startup();

        let _ = effects.recv().await.unwrap();
        let _ = effects.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        match effects.recv().await.unwrap() {
            ElectionEffect::BroadcastResult { primary_id, reason } => {
                assert_eq!(primary_id, "dev-a");
                assert_eq!(reason, "election");
            }
            other => panic!("expected BroadcastResult, got {other:?}"),
        }
        match effects.recv().await.unwrap() {
            ElectionEffect::Decided { is_local, .. } => assert!(is_local),
            other => panic!("expected Decided, got {other:?}"),
        }
        assert!(coordinator.is_local_primary());
    }

    #[tokio::test(start_paused = true)]
    async fn primary_loss_waits_out_the_grace_period() {
        let (coordinator, _effects) =
            ElectionCoordinator::new("dev-a", false, ElectionConfig::default());
        coordinator.mark_started();

        coordinator.handle_primary_lost("dev-b");
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(coordinator.phase(), ElectionPhase::Waiting);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(coordinator.phase(), ElectionPhase::Collecting);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_result_cancels_a_running_round() {
        let (coordinator, mut effects) =
            ElectionCoordinator::new("dev-b", false, ElectionConfig::default());
        coordinator.mark_started();
        coordinator.handle_no_primary_on_startup();
        let _ = effects.recv().await.unwrap();
        let _ = effects.recv().await.unwrap();

        coordinator.handle_result("dev-a");
        match effects.recv().await.unwrap() {
            ElectionEffect::Decided {
                primary_id,
                is_local,
            } => {
                assert_eq!(primary_id, "dev-a");
                assert!(!is_local);
            }
            other => panic!("expected Decided, got {other:?}"),
        }

        // The round timer was cancelled — nothing further fires.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(effects.try_recv().is_err());
        assert_eq!(coordinator.primary_id().as_deref(), Some("dev-a"));
    }
}
