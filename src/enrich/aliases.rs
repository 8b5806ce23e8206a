// src/enrich/aliases.rs
//! Company alias cache: curated seed entries plus aliases learned from the
//! securities master. Read-mostly: lookups clone an `Arc` snapshot; all
//! writes funnel through a single owning task that also persists them, so
//! learned aliases survive restarts and never race.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::model::{Alias, AliasOrigin};
use crate::shutdown::Shutdown;
use crate::storage::refdata::RefDataStore;

type Snapshot = Arc<HashMap<String, Alias>>;

pub struct AliasCache {
    snapshot: RwLock<Snapshot>,
    learn_tx: mpsc::UnboundedSender<Alias>,
}

impl AliasCache {
    /// Build from persisted aliases layered over the curated seed set.
    /// Returns the receiver for the single writer task.
    pub fn new(persisted: Vec<Alias>) -> (Arc<Self>, mpsc::UnboundedReceiver<Alias>) {
        let mut map: HashMap<String, Alias> = HashMap::new();
        for alias in curated_seed() {
            map.insert(alias.normalized.clone(), alias);
        }
        // Learned entries never shadow curated ones.
        for alias in persisted {
            match map.get(&alias.normalized) {
                Some(existing) if existing.origin == AliasOrigin::Curated => {}
                _ => {
                    map.insert(alias.normalized.clone(), alias);
                }
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                snapshot: RwLock::new(Arc::new(map)),
                learn_tx: tx,
            }),
            rx,
        )
    }

    pub fn lookup(&self, normalized: &str) -> Option<Alias> {
        self.snapshot.read().get(normalized).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }

    /// Learn a new alias. Monotonic: an existing entry is never replaced.
    /// The snapshot is updated copy-on-write; persistence happens in the
    /// writer task.
    pub fn learn(&self, alias: Alias) {
        {
            let mut guard = self.snapshot.write();
            if guard.contains_key(&alias.normalized) {
                return;
            }
            let mut next: HashMap<String, Alias> = (**guard).clone();
            next.insert(alias.normalized.clone(), alias.clone());
            *guard = Arc::new(next);
        }
        if self.learn_tx.send(alias).is_err() {
            warn!(target: "enrich", "alias writer gone; learned alias not persisted");
        }
    }
}

/// The single task that persists learned aliases.
pub fn spawn_alias_writer(
    mut rx: mpsc::UnboundedReceiver<Alias>,
    refdata: RefDataStore,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(alias) => {
                        if let Err(e) = refdata.insert_alias(&alias).await {
                            warn!(target: "enrich", alias = %alias.normalized, error = %e, "alias persist failed");
                        } else {
                            info!(target: "enrich", alias = %alias.normalized, ticker = %alias.ticker, "alias learned");
                        }
                    }
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

/// Curated alias seed, verified by hand against the exchange listing.
pub fn curated_seed() -> Vec<Alias> {
    fn curated(normalized: &str, ticker: &str) -> Alias {
        Alias {
            normalized: normalized.to_string(),
            ticker: ticker.to_string(),
            origin: AliasOrigin::Curated,
            confidence: 1.0,
        }
    }

    vec![
        curated("сбер", "SBER"),
        curated("сбербанк", "SBER"),
        curated("сбербанк россии", "SBER"),
        curated("sberbank", "SBER"),
        curated("газпром", "GAZP"),
        curated("gazprom", "GAZP"),
        curated("втб", "VTBR"),
        curated("втб банк", "VTBR"),
        curated("роснефть", "ROSN"),
        curated("rosneft", "ROSN"),
        curated("лукойл", "LKOH"),
        curated("lukoil", "LKOH"),
        curated("яндекс", "YNDX"),
        curated("yandex", "YNDX"),
        curated("мтс", "MTSS"),
        curated("мобильные телесистемы", "MTSS"),
        curated("норникель", "GMKN"),
        curated("норильский никель", "GMKN"),
        curated("гмк норильский никель", "GMKN"),
        curated("новатэк", "NVTK"),
        curated("полюс", "PLZL"),
        curated("алроса", "ALRS"),
        curated("магнит", "MGNT"),
        curated("x5", "FIVE"),
        curated("x5 retail", "FIVE"),
        curated("пятерочка", "FIVE"),
        curated("аэрофлот", "AFLT"),
        curated("русгидро", "HYDR"),
        curated("интер рао", "IRAO"),
        curated("сургутнефтегаз", "SNGS"),
        curated("татнефть", "TATN"),
        curated("нлмк", "NLMK"),
        curated("ммк", "MAGN"),
        curated("северсталь", "CHMF"),
        curated("пик", "PIKK"),
        curated("мосбиржа", "MOEX"),
        curated("московская биржа", "MOEX"),
        curated("русал", "RUAL"),
        curated("фосагро", "PHOR"),
        curated("озон", "OZON"),
        curated("ozon", "OZON"),
        curated("хэдхантер", "HHRU"),
        curated("positive technologies", "POSI"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curated_seed_wins_over_persisted_learned() {
        let persisted = vec![Alias {
            normalized: "сбер".into(),
            ticker: "WRONG".into(),
            origin: AliasOrigin::Learned,
            confidence: 0.5,
        }];
        let (cache, _rx) = AliasCache::new(persisted);
        assert_eq!(cache.lookup("сбер").unwrap().ticker, "SBER");
    }

    #[test]
    fn learn_is_monotonic() {
        let (cache, mut rx) = AliasCache::new(Vec::new());
        cache.learn(Alias {
            normalized: "пао лукойл".into(),
            ticker: "LKOH".into(),
            origin: AliasOrigin::Learned,
            confidence: 0.8,
        });
        cache.learn(Alias {
            normalized: "пао лукойл".into(),
            ticker: "OTHER".into(),
            origin: AliasOrigin::Learned,
            confidence: 0.9,
        });
        assert_eq!(cache.lookup("пао лукойл").unwrap().ticker, "LKOH");
        // only the first learn reaches the writer
        assert_eq!(rx.try_recv().unwrap().ticker, "LKOH");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn snapshot_is_copy_on_write() {
        let (cache, _rx) = AliasCache::new(Vec::new());
        let before = cache.len();
        cache.learn(Alias {
            normalized: "группа астра".into(),
            ticker: "ASTR".into(),
            origin: AliasOrigin::Learned,
            confidence: 0.8,
        });
        assert_eq!(cache.len(), before + 1);
    }
}
