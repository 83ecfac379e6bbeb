pub mod worker;

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::SymbolFilter;
use crate::writer::KlineSink;
use crate::ws::Connector;

use self::worker::{StreamWorker, WorkerSettings};

/// Contiguous groups of at most `group_size` symbols, one connection each.
pub fn partition(symbols: &[String], group_size: usize) -> Vec<Vec<String>> {
    symbols
        .chunks(group_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

pub fn filter_symbols(symbols: Vec<String>, filter: Option<&SymbolFilter>) -> Vec<String> {
    match filter {
        Some(f) => symbols.into_iter().filter(|s| f.allows(s)).collect(),
        None => symbols,
    }
}

/// Running shard tasks. Dropping the set does not stop them; call [`ShardSet::abort_all`].
#[derive(Default)]
pub struct ShardSet {
    handles: Vec<JoinHandle<()>>,
}

impl ShardSet {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn abort_all(&self) {
        for h in &self.handles {
            h.abort();
        }
    }

    /// Abort every shard and wait for the tasks to unwind.
    pub async fn shutdown(self) {
        self.abort_all();
        futures_util::future::join_all(self.handles).await;
    }

    pub fn extend(&mut self, other: ShardSet) {
        self.handles.extend(other.handles);
    }
}

/// Spawns `ceil(symbols / group_size)` workers. Worker `i` waits `i * stagger` before
/// its first connect. Each worker gets its own sink from `make_sink`.
pub fn spawn_shards<C, S, M>(
    symbols: &[String],
    group_size: usize,
    stagger: Duration,
    settings: &WorkerSettings,
    connector: C,
    mut make_sink: M,
) -> anyhow::Result<ShardSet>
where
    C: Connector + Clone + 'static,
    S: KlineSink + 'static,
    M: FnMut(usize) -> anyhow::Result<S>,
{
    let groups = partition(symbols, group_size);
    info!(
        market = %settings.market,
        symbols = symbols.len(),
        shards = groups.len(),
        group_size,
        "spawn stream shards"
    );
    let mut set = ShardSet::default();
    for (id, group) in groups.into_iter().enumerate() {
        let sink = make_sink(id)?;
        let mut worker_settings = settings.clone();
        worker_settings.start_delay = stagger.saturating_mul(id as u32);
        let worker = StreamWorker::new(id, group, worker_settings, connector.clone(), sink);
        set.handles.push(tokio::spawn(worker.run()));
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syms(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("S{i}")).collect()
    }

    #[test]
    fn partition_into_groups_of_five() {
        let groups = partition(&syms(12), 5);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], vec!["S0", "S1", "S2", "S3", "S4"]);
        assert_eq!(groups[2], vec!["S10", "S11"]);
        assert!(partition(&[], 5).is_empty());
        assert_eq!(partition(&syms(3), 0).len(), 3);
    }

    #[test]
    fn filter_keeps_allowed_symbols() {
        let filter = SymbolFilter {
            quote_suffixes: vec!["USDT".to_string(), "BTC".to_string()],
            max_len: 12,
        };
        let out = filter_symbols(
            vec![
                "BTCUSDT".to_string(),
                "ETHBTC".to_string(),
                "BTCTRY".to_string(),
                "1INCHUSDT".to_string(),
            ],
            Some(&filter),
        );
        assert_eq!(out, vec!["BTCUSDT", "ETHBTC"]);
        assert_eq!(filter_symbols(syms(2), None).len(), 2);
    }
}
