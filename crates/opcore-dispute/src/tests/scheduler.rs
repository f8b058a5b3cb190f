use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy_primitives::Address;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::fixtures::addr;
use crate::{
    trace::TraceError, ContractError, GameDirs, GamePlayer, GameScheduler, GameSource, GameStatus,
};

#[derive(Default)]
struct Load {
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Finishes with `outcome` on its `rounds`-th call.
struct FakePlayer {
    address: Address,
    rounds: usize,
    outcome: GameStatus,
    calls: AtomicUsize,
    load: Arc<Load>,
}

impl FakePlayer {
    fn new(n: u8, rounds: usize, outcome: GameStatus, load: Arc<Load>) -> Arc<Self> {
        Arc::new(Self { address: addr(n), rounds, outcome, calls: AtomicUsize::new(0), load })
    }
}

#[async_trait]
impl GamePlayer for FakePlayer {
    fn game_address(&self) -> Address {
        self.address
    }

    async fn progress(&self, _now: u64) -> Result<GameStatus, TraceError> {
        let running = self.load.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.load.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.load.running.fetch_sub(1, Ordering::SeqCst);

        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.rounds == 0 {
            return Err(TraceError::NoStepData);
        }
        Ok(if call >= self.rounds { self.outcome } else { GameStatus::InProgress })
    }
}

/// Lists every game it was given, finishing each after one round. Game 0 cannot be played.
struct FakeSource {
    games: Vec<u8>,
    load: Arc<Load>,
    built: AtomicUsize,
}

#[async_trait]
impl GameSource for FakeSource {
    async fn games(&self, _now: u64) -> Result<Vec<Address>, ContractError> {
        Ok(self.games.iter().map(|&n| addr(n)).collect())
    }

    async fn player(&self, game: Address) -> Result<Arc<dyn GamePlayer>, ContractError> {
        let n = game[19];
        if n == 0 {
            return Err(ContractError::Malformed("no claims".into()));
        }
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(FakePlayer::new(n, 1, GameStatus::DefenderWins, self.load.clone()))
    }
}

#[tokio::test]
async fn scheduler_caps_concurrency_and_drops_finished_games() {
    let root = tempfile::tempdir().unwrap();
    let dirs = GameDirs::new(root.path());
    let load = Arc::new(Load::default());
    let mut scheduler = GameScheduler::new(dirs.clone(), 2);

    for n in 1..=5 {
        let outcome = if n % 2 == 0 { GameStatus::DefenderWins } else { GameStatus::ChallengerWins };
        scheduler.add(FakePlayer::new(n, n as usize, outcome, load.clone())).unwrap();
    }
    assert_eq!(scheduler.len(), 5);
    assert!(dirs.dir(addr(3)).is_dir());

    let statuses = scheduler.schedule(0).await;
    assert_eq!(statuses.len(), 5);
    assert_eq!(statuses[0], (addr(1), GameStatus::ChallengerWins));
    assert_eq!(statuses[1], (addr(2), GameStatus::InProgress));
    assert_eq!(load.peak.load(Ordering::SeqCst), 2);
    assert!(!scheduler.contains(addr(1)));
    assert!(!dirs.dir(addr(1)).exists());
    assert_eq!(scheduler.len(), 4);

    scheduler.schedule(1).await;
    assert_eq!(dirs.list().unwrap(), vec![addr(3), addr(4), addr(5)]);
}

#[tokio::test]
async fn failing_games_stay_scheduled() {
    let root = tempfile::tempdir().unwrap();
    let mut scheduler = GameScheduler::new(GameDirs::new(root.path()), 4);
    let load = Arc::new(Load::default());
    scheduler.add(FakePlayer::new(7, 0, GameStatus::DefenderWins, load)).unwrap();

    assert!(scheduler.schedule(0).await.is_empty());
    assert!(scheduler.contains(addr(7)));
    assert!(!scheduler.is_empty());
}

#[tokio::test]
async fn run_prunes_stale_directories_and_stops_on_cancel() {
    let root = tempfile::tempdir().unwrap();
    let dirs = GameDirs::new(root.path());
    dirs.create(addr(9)).unwrap();
    std::fs::create_dir(root.path().join("not-a-game")).unwrap();
    std::fs::write(root.path().join("game-notes.txt"), b"").unwrap();

    let mut scheduler = GameScheduler::new(dirs.clone(), 1);
    let load = Arc::new(Load::default());
    scheduler.add(FakePlayer::new(1, 1000, GameStatus::DefenderWins, load)).unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(Duration::from_millis(10), cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(dirs.list().unwrap(), vec![addr(1)]);
    assert!(root.path().join("not-a-game").is_dir());
}

#[tokio::test]
async fn discovered_games_are_played_once() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource { games: vec![0, 1, 2], load: Arc::default(), built: AtomicUsize::new(0) });
    let mut scheduler = GameScheduler::new(GameDirs::new(root.path()), 2).with_source(source.clone());

    assert_eq!(scheduler.discover(0).await.unwrap(), 2);
    assert!(scheduler.contains(addr(1)) && scheduler.contains(addr(2)));
    assert!(!scheduler.contains(addr(0)));
    assert_eq!(scheduler.discover(0).await.unwrap(), 0);
    assert_eq!(source.built.load(Ordering::SeqCst), 2);

    let statuses = scheduler.schedule(1).await;
    assert_eq!(statuses, vec![(addr(1), GameStatus::DefenderWins), (addr(2), GameStatus::DefenderWins)]);
    assert!(scheduler.is_empty());

    // Still listed by the source, but already finished.
    assert_eq!(scheduler.discover(2).await.unwrap(), 0);
    assert_eq!(source.built.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn scheduler_without_a_source_discovers_nothing() {
    let root = tempfile::tempdir().unwrap();
    let mut scheduler = GameScheduler::new(GameDirs::new(root.path()), 1);
    assert_eq!(scheduler.discover(0).await.unwrap(), 0);
    assert!(scheduler.is_empty());
}

#[test]
fn game_dirs_ignore_unrelated_entries() {
    let root = tempfile::tempdir().unwrap();
    let dirs = GameDirs::new(root.path().join("games"));
    assert!(dirs.list().unwrap().is_empty());

    for n in [3, 1, 2] {
        dirs.create(addr(n)).unwrap();
    }
    std::fs::create_dir(dirs.root().join("game-zz")).unwrap();
    assert_eq!(dirs.list().unwrap(), vec![addr(1), addr(2), addr(3)]);

    let keep = HashSet::from([addr(2)]);
    assert_eq!(dirs.prune(&keep).unwrap(), 2);
    assert_eq!(dirs.list().unwrap(), vec![addr(2)]);
    dirs.remove(addr(5)).unwrap();
    assert!(dirs.dir(addr(2)).ends_with(format!("game-{}", hex::encode(addr(2)))));
}
