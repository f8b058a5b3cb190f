//! Progresses every tracked game on a bounded number of workers, and keeps a scratch directory
//! per game for as long as the game is live.

use std::{
    collections::{HashMap, HashSet},
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use alloy_primitives::Address;
use async_trait::async_trait;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{contract::ContractError, game::GameStatus, trace::TraceError};

/// Games progressed at the same time.
pub const MAX_CONCURRENCY: usize = 4;

const DIR_PREFIX: &str = "game-";

/// Something that can move one game forward.
#[async_trait]
pub trait GamePlayer: Send + Sync {
    fn game_address(&self) -> Address;

    async fn progress(&self, now: u64) -> Result<GameStatus, TraceError>;
}

/// Where the scheduler finds games and the players for them.
#[async_trait]
pub trait GameSource: Send + Sync {
    /// Games still in progress that are recent enough to be played.
    async fn games(&self, now: u64) -> Result<Vec<Address>, ContractError>;

    async fn player(&self, game: Address) -> Result<Arc<dyn GamePlayer>, ContractError>;
}

/// `<root>/game-<address>` directories.
#[derive(Debug, Clone)]
pub struct GameDirs {
    root: PathBuf,
}

impl GameDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, game: Address) -> PathBuf {
        self.root.join(format!("{DIR_PREFIX}{}", hex::encode(game)))
    }

    pub fn create(&self, game: Address) -> io::Result<PathBuf> {
        let dir = self.dir(game);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn remove(&self, game: Address) -> io::Result<()> {
        match std::fs::remove_dir_all(self.dir(game)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Games that have a directory. Unrelated entries are ignored.
    pub fn list(&self) -> io::Result<Vec<Address>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut games = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(suffix) = name.to_str().and_then(|n| n.strip_prefix(DIR_PREFIX)) else {
                continue;
            };
            if let Ok(address) = suffix.parse::<Address>() {
                games.push(address);
            }
        }
        games.sort();
        Ok(games)
    }

    /// Remove the directories of games not in `keep`.
    pub fn prune(&self, keep: &HashSet<Address>) -> io::Result<usize> {
        let mut removed = 0;
        for game in self.list()? {
            if !keep.contains(&game) {
                self.remove(game)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub struct GameScheduler {
    players: HashMap<Address, Arc<dyn GamePlayer>>,
    dirs: GameDirs,
    permits: Arc<Semaphore>,
    source: Option<Arc<dyn GameSource>>,
    /// Games seen to finish, never picked up again.
    finished: HashSet<Address>,
}

impl fmt::Debug for GameScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameScheduler")
            .field("games", &self.players.len())
            .field("dirs", &self.dirs)
            .field("finished", &self.finished.len())
            .finish_non_exhaustive()
    }
}

impl GameScheduler {
    pub fn new(dirs: GameDirs, max_concurrency: usize) -> Self {
        Self {
            players: HashMap::new(),
            dirs,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            source: None,
            finished: HashSet::new(),
        }
    }

    /// Pick up new games from `source` on every round.
    pub fn with_source(mut self, source: Arc<dyn GameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub const fn dirs(&self) -> &GameDirs {
        &self.dirs
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn contains(&self, game: Address) -> bool {
        self.players.contains_key(&game)
    }

    /// Track a game and create its directory.
    pub fn add(&mut self, player: Arc<dyn GamePlayer>) -> io::Result<()> {
        let game = player.game_address();
        self.dirs.create(game)?;
        self.players.insert(game, player);
        debug!(target: "opcore::dispute", %game, "tracking game");
        Ok(())
    }

    /// Add a player for every game the source lists that is not tracked yet. Returns how many
    /// were added; a game whose player cannot be built is retried next time.
    pub async fn discover(&mut self, now: u64) -> Result<usize, ContractError> {
        let Some(source) = self.source.clone() else {
            return Ok(0);
        };
        let mut added = 0;
        for game in source.games(now).await? {
            if self.players.contains_key(&game) || self.finished.contains(&game) {
                continue;
            }
            match source.player(game).await {
                Ok(player) => {
                    if let Err(err) = self.add(player) {
                        warn!(target: "opcore::dispute", %game, %err, "failed to create game directory");
                        continue;
                    }
                    added += 1;
                }
                Err(err) => warn!(target: "opcore::dispute", %game, %err, "cannot play game"),
            }
        }
        if added > 0 {
            info!(target: "opcore::dispute", added, games = self.players.len(), "discovered games");
        }
        Ok(added)
    }

    /// Progress every game once. Resolved games are dropped along with their directories.
    pub async fn schedule(&mut self, now: u64) -> Vec<(Address, GameStatus)> {
        let mut tasks = JoinSet::new();
        for player in self.players.values().cloned() {
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let game = player.game_address();
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (game, Ok(GameStatus::InProgress));
                };
                (game, player.progress(now).await)
            });
        }

        let mut statuses = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (game, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(target: "opcore::dispute", %err, "game task failed");
                    continue;
                }
            };
            match result {
                Ok(status) => statuses.push((game, status)),
                Err(err) => warn!(target: "opcore::dispute", %game, %err, "failed to progress game"),
            }
        }

        for (game, status) in &statuses {
            if *status == GameStatus::InProgress {
                continue;
            }
            info!(target: "opcore::dispute", %game, ?status, "game finished");
            self.players.remove(game);
            self.finished.insert(*game);
            if let Err(err) = self.dirs.remove(*game) {
                warn!(target: "opcore::dispute", %game, %err, "failed to remove game directory");
            }
        }
        statuses.sort_by_key(|(game, _)| *game);
        statuses
    }

    /// Progress games every `interval` until cancelled.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) -> io::Result<()> {
        if let Err(err) = self.discover(unix_now()).await {
            warn!(target: "opcore::dispute", %err, "failed to list games");
        }
        let live = self.players.keys().copied().collect();
        let pruned = self.dirs.prune(&live)?;
        info!(target: "opcore::dispute", games = self.players.len(), pruned, "dispute scheduler started");
        loop {
            self.schedule(unix_now()).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(err) = self.discover(unix_now()).await {
                warn!(target: "opcore::dispute", %err, "failed to list games");
            }
        }
        info!(target: "opcore::dispute", games = self.players.len(), "dispute scheduler stopped");
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}
