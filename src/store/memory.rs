use super::{
    parse_bucket, step_bucket, BucketParams, CoordinationStore, StoreError, TokenGrant,
    FIELD_LAST_REFILL, FIELD_TOKENS,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Single-process coordination store. Each call holds one lock for its whole
/// read-modify-write, which gives the same atomicity a shared store provides
/// across processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop `key` if it has expired, then hand back whatever is still live.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let expired = entries
        .get(key)
        .and_then(|e| e.expires_at)
        .is_some_and(|at| at <= Instant::now());
    if expired {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut VecDeque<String>, StoreError> {
    if live(entries, key).is_none() {
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            },
        );
    }
    match entries.get_mut(key).map(|e| &mut e.value) {
        Some(Value::List(list)) => Ok(list),
        _ => Err(StoreError::Malformed {
            key: key.to_string(),
            value: "not a list".into(),
        }),
    }
}

fn expire(entries: &mut HashMap<String, Entry>, key: &str, ttl: Duration) {
    if let Some(entry) = entries.get_mut(key) {
        entry.expires_at = Some(Instant::now() + ttl);
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn take_token(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: i64,
    ) -> Result<TokenGrant, StoreError> {
        let mut entries = self.lock();
        let current = match live(&mut entries, key).map(|e| &e.value) {
            Some(Value::Hash(h)) => parse_bucket(
                key,
                h.get(FIELD_TOKENS).map(String::as_str),
                h.get(FIELD_LAST_REFILL).map(String::as_str),
            )?,
            Some(Value::List(_)) => {
                return Err(StoreError::Malformed {
                    key: key.to_string(),
                    value: "not a hash".into(),
                })
            }
            None => None,
        };

        let grant = step_bucket(current, params, now_ms);
        let hash = HashMap::from([
            (FIELD_TOKENS.to_string(), grant.state.tokens.to_string()),
            (
                FIELD_LAST_REFILL.to_string(),
                grant.state.last_refill_ms.to_string(),
            ),
        ]);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(hash),
                expires_at: Some(Instant::now() + params.ttl),
            },
        );
        Ok(grant)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.lock();
        Ok(match live(&mut entries, key).map(|e| &e.value) {
            Some(Value::Hash(h)) => h.get(field).cloned(),
            _ => None,
        })
    }

    async fn push_back(&self, key: &str, value: String, ttl: Duration) -> Result<usize, StoreError> {
        let mut entries = self.lock();
        let list = list_mut(&mut entries, key)?;
        list.push_back(value);
        let len = list.len();
        expire(&mut entries, key, ttl);
        Ok(len)
    }

    async fn push_front(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        let mut entries = self.lock();
        let list = list_mut(&mut entries, key)?;
        for value in values.into_iter().rev() {
            list.push_front(value);
        }
        let len = list.len();
        expire(&mut entries, key, ttl);
        Ok(len)
    }

    async fn pop_front(&self, key: &str, max: usize) -> Result<Vec<String>, StoreError> {
        let mut entries = self.lock();
        let Some(Value::List(list)) = live(&mut entries, key).map(|e| &mut e.value) else {
            return Ok(Vec::new());
        };
        let n = max.min(list.len());
        let popped: Vec<String> = list.drain(..n).collect();
        if list.is_empty() {
            entries.remove(key);
        }
        Ok(popped)
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        let mut entries = self.lock();
        Ok(match live(&mut entries, key).map(|e| &e.value) {
            Some(Value::List(list)) => list.len(),
            _ => 0,
        })
    }

    async fn front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.lock();
        Ok(match live(&mut entries, key).map(|e| &e.value) {
            Some(Value::List(list)) => list.front().cloned(),
            _ => None,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }
}
