use super::types::OplogDraft;
use crate::core::KVStore;
use tracing::debug;

/// A client command that changes state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Set { key: String, value: String },
    Expire { key: String, ttl_secs: i64 },
    Del { key: String },
    FlushDb,
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Set { .. } => "SET",
            Mutation::Expire { .. } => "EXPIRE",
            Mutation::Del { .. } => "DEL",
            Mutation::FlushDb => "FLUSHDB",
        }
    }
}

/// Maps mutations to canonical, replayable oplog drafts
///
/// - `SET k v` -> `SET k v 0`
/// - `EXPIRE k ttl` on a live key -> `SET k <current value> <now_ms + ttl*1000>`
/// - `EXPIRE k ttl` with `ttl <= 0` on a live key -> `DEL k`
/// - `DEL k` on a live key -> `DEL k`
/// - `FLUSHDB` -> one `DEL` per live key
///
/// Missing keys produce nothing. The caller must hold the engine's write gate
/// so that the view of `kv` cannot change before the drafts are applied.
pub struct CommandTranslator;

impl CommandTranslator {
    pub async fn translate(kv: &KVStore, mutation: &Mutation, now_ms: u64) -> Vec<OplogDraft> {
        let drafts = match mutation {
            Mutation::Set { key, value } => vec![OplogDraft::set(key.as_str(), value.as_str(), 0)],
            Mutation::Expire { key, ttl_secs } => match kv.entry(key).await {
                Some(_) if *ttl_secs <= 0 => vec![OplogDraft::del(key.as_str())],
                Some((value, _)) => {
                    let ttl_ms = (*ttl_secs as u64).saturating_mul(1000);
                    vec![OplogDraft::set(
                        key.as_str(),
                        value,
                        now_ms.saturating_add(ttl_ms),
                    )]
                }
                None => Vec::new(),
            },
            Mutation::Del { key } => {
                if kv.exists(key).await {
                    vec![OplogDraft::del(key.as_str())]
                } else {
                    Vec::new()
                }
            }
            Mutation::FlushDb => kv.keys().await.into_iter().map(OplogDraft::del).collect(),
        };

        debug!(
            "Translated {} into {} oplog draft(s)",
            mutation.name(),
            drafts.len()
        );
        drafts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::KVConfig;
    use crate::oplog::types::OplogCommand;

    const NOW: u64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_set() {
        let kv = KVStore::new(KVConfig::default());
        let drafts = CommandTranslator::translate(
            &kv,
            &Mutation::Set {
                key: "k".into(),
                value: "v".into(),
            },
            NOW,
        )
        .await;
        assert_eq!(drafts, vec![OplogDraft::set("k", "v", 0)]);
    }

    #[tokio::test]
    async fn test_expire_uses_absolute_deadline() {
        let kv = KVStore::new(KVConfig::default());
        kv.put("k", "v".to_string(), 0).await;

        let drafts = CommandTranslator::translate(
            &kv,
            &Mutation::Expire {
                key: "k".into(),
                ttl_secs: 10,
            },
            NOW,
        )
        .await;
        assert_eq!(drafts, vec![OplogDraft::set("k", "v", NOW + 10_000)]);
    }

    #[tokio::test]
    async fn test_expire_missing_key_produces_nothing() {
        let kv = KVStore::new(KVConfig::default());
        let drafts = CommandTranslator::translate(
            &kv,
            &Mutation::Expire {
                key: "missing".into(),
                ttl_secs: 10,
            },
            NOW,
        )
        .await;
        assert!(drafts.is_empty());
    }

    #[tokio::test]
    async fn test_expire_non_positive_ttl_deletes() {
        let kv = KVStore::new(KVConfig::default());
        kv.put("k", "v".to_string(), 0).await;

        let drafts = CommandTranslator::translate(
            &kv,
            &Mutation::Expire {
                key: "k".into(),
                ttl_secs: 0,
            },
            NOW,
        )
        .await;
        assert_eq!(drafts, vec![OplogDraft::del("k")]);
    }

    #[tokio::test]
    async fn test_del_and_flushdb() {
        let kv = KVStore::new(KVConfig::default());
        kv.put("a", "1".to_string(), 0).await;
        kv.put("b", "2".to_string(), 0).await;

        let del = CommandTranslator::translate(&kv, &Mutation::Del { key: "a".into() }, NOW).await;
        assert_eq!(del, vec![OplogDraft::del("a")]);

        let missing =
            CommandTranslator::translate(&kv, &Mutation::Del { key: "zz".into() }, NOW).await;
        assert!(missing.is_empty());

        let flush = CommandTranslator::translate(&kv, &Mutation::FlushDb, NOW).await;
        assert_eq!(flush.len(), 2);
        assert!(flush.iter().all(|d| d.command == OplogCommand::Del));
    }
}
