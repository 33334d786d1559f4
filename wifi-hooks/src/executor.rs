// Bounded command execution with result caching

//! Cache-backed external command execution
//!
//! Every external process this crate spawns goes through [`CommandExecutor`]:
//! a fixed-size pool bounds how many processes run at once, and idempotent
//! query commands can reuse a recent result instead of re-spawning. Results
//! of failed executions are never cached, so transient failures are retried
//! on the next call.
//!
//! Callers choose the caching behavior per call: [`CommandExecutor::execute`]
//! and [`CommandExecutor::execute_shell`] always spawn (side-effecting hook
//! commands must not be replayed from cache), while
//! [`CommandExecutor::execute_cached`] is for read-only queries such as
//! network state probes.

use crate::error::HookError;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{RwLock, Semaphore};

/// Default number of commands that may run concurrently
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default lifetime of a cached command result
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// A command invocation: program plus arguments
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Canonical string form, used as the cache key
    pub fn canonical(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Outcome of one command execution
#[derive(Debug)]
pub struct CommandResult {
    /// Canonical command string
    pub command: String,
    /// Combined stdout and stderr
    pub output: String,
    /// Spawn failure or non-zero exit, if any
    pub error: Option<HookError>,
    /// Wall-clock execution time (zero for cache hits)
    pub duration: Duration,
    /// Whether the result was served from cache
    pub from_cache: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

struct CacheEntry {
    output: String,
    captured_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.captured_at) <= self.ttl
    }
}

/// Cache introspection snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Inner {
    pool: Arc<Semaphore>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    default_ttl: Duration,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Bounded-concurrency, cache-backed executor for external processes
///
/// Cheap to clone; all clones share the pool and the cache.
#[derive(Clone)]
pub struct CommandExecutor {
    inner: Arc<Inner>,
}

impl CommandExecutor {
    /// Create an executor with the given pool capacity and cache TTL
    pub fn new(pool_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool: Arc::new(Semaphore::new(pool_size.max(1))),
                cache: RwLock::new(HashMap::new()),
                default_ttl,
                closed: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Run a command through the pool, bypassing the cache
    pub async fn execute(&self, spec: &CommandSpec) -> Result<CommandResult> {
        self.ensure_open()?;
        self.spawn_one(spec).await
    }

    /// Run a shell command line (`sh -c`) through the pool, bypassing the cache
    pub async fn execute_shell(&self, command_line: &str) -> Result<CommandResult> {
        self.execute(&CommandSpec::new("sh", ["-c", command_line]))
            .await
    }

    /// Run a read-only command, serving a live cached result when one exists
    ///
    /// A hit returns immediately with `from_cache = true` and zero duration.
    /// On a miss the command runs through the pool and a successful result is
    /// stored under its canonical string with the executor's default TTL.
    pub async fn execute_cached(&self, spec: &CommandSpec) -> Result<CommandResult> {
        self.ensure_open()?;
        let key = spec.canonical();

        {
            let cache = self.inner.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.is_live(Instant::now()) {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(CommandResult {
                        command: key,
                        output: entry.output.clone(),
                        error: None,
                        duration: Duration::ZERO,
                        from_cache: true,
                    });
                }
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        let result = self.spawn_one(spec).await?;

        if result.success() {
            let mut cache = self.inner.cache.write().await;
            cache.insert(
                key,
                CacheEntry {
                    output: result.output.clone(),
                    captured_at: Instant::now(),
                    ttl: self.inner.default_ttl,
                },
            );
        } else {
            // Expired entry for this key must not be served later
            let mut cache = self.inner.cache.write().await;
            cache.remove(&key);
        }

        Ok(result)
    }

    /// Run a batch of read-only commands, preserving input order
    ///
    /// All commands are dispatched through the shared pool, so throughput is
    /// capped by pool capacity rather than batch size.
    pub async fn execute_batch(&self, commands: &[CommandSpec]) -> Result<Vec<CommandResult>> {
        self.ensure_open()?;

        let mut handles = Vec::with_capacity(commands.len());
        for spec in commands {
            let executor = self.clone();
            let spec = spec.clone();
            handles.push(tokio::spawn(
                async move { executor.execute_cached(&spec).await },
            ));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(|e| {
                anyhow::anyhow!("batch execution task panicked: {}", e)
            })??);
        }
        Ok(results)
    }

    /// Snapshot of cache occupancy and hit/miss counters
    pub async fn cache_stats(&self) -> CacheStats {
        let cache = self.inner.cache.read().await;
        CacheStats {
            entries: cache.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached result
    pub async fn clear_cache(&self) {
        self.inner.cache.write().await.clear();
    }

    /// Release pool resources; all calls after this fail fast
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            anyhow::bail!("command executor is closed");
        }
        Ok(())
    }

    async fn spawn_one(&self, spec: &CommandSpec) -> Result<CommandResult> {
        let key = spec.canonical();

        // Callers beyond pool capacity wait here until a slot frees
        let permit = match self.inner.pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => anyhow::bail!("command executor is closed"),
        };

        let start = Instant::now();
        // kill_on_drop: a caller abandoning the future (rule timeout) must
        // not leave the process running
        let output = Command::new(&spec.program)
            .args(&spec.args)
            .kill_on_drop(true)
            .output()
            .await;
        let duration = start.elapsed();
        drop(permit);

        match output {
            Err(source) => Ok(CommandResult {
                command: key.clone(),
                output: String::new(),
                error: Some(HookError::CommandSpawn {
                    command: key,
                    source,
                }),
                duration,
                from_cache: false,
            }),
            Ok(output) => {
                let mut combined =
                    String::with_capacity(output.stdout.len() + output.stderr.len());
                combined.push_str(&String::from_utf8_lossy(&output.stdout));
                combined.push_str(&String::from_utf8_lossy(&output.stderr));

                let error = if output.status.success() {
                    None
                } else {
                    Some(HookError::NonZeroExit {
                        command: key.clone(),
                        status: output.status,
                    })
                };

                Ok(CommandResult {
                    command: key,
                    output: combined,
                    error,
                    duration,
                    from_cache: false,
                })
            }
        }
    }
}
