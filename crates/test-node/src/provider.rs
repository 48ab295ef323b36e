//! # Provider
//!
//! An in-memory implementation of the engine's provider traits. Each store
//! serializes its own state behind a mutex; queries delegate matching,
//! ordering, and pagination to the engine's `Query` model so behaviour
//! matches any conformant backend.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use dwn_engine::did::{self, Document};
use dwn_engine::event::{Event, SubscribeFilter, Subscriber};
use dwn_engine::provider::{
    DataStore, DidResolver, EventLog, EventStream, MessageStore, Provider, TaskStore,
};
use dwn_engine::store::{Cursor, Entry, Query};
use dwn_engine::tasks::ResumableTask;
use futures::channel::mpsc;

/// An in-memory web node provider.
#[derive(Clone, Default)]
pub struct ProviderImpl {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    // owner -> message cid -> entry
    messages: Mutex<HashMap<String, HashMap<String, Entry>>>,
    // owner -> (record id, data cid) -> data
    data: Mutex<HashMap<String, HashMap<(String, String), Vec<u8>>>>,
    // owner -> events in append order
    events: Mutex<HashMap<String, Vec<(String, Event)>>>,
    // owner -> subscribers
    subscribers: Mutex<HashMap<String, Vec<SubscriberEntry>>>,
    // owner -> task id -> (task, grabbable-at epoch seconds)
    tasks: Mutex<HashMap<String, HashMap<String, (ResumableTask, u64)>>>,
}

struct SubscriberEntry {
    filter: SubscribeFilter,
    sender: mpsc::UnboundedSender<Event>,
}

impl ProviderImpl {
    /// Create a new, empty provider.
    ///
    /// # Errors
    ///
    /// Infallible for the in-memory implementation.
    pub async fn new() -> Result<Self> {
        Ok(Self::default())
    }
}

impl Provider for ProviderImpl {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("store mutex poisoned")
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl MessageStore for ProviderImpl {
    async fn put(&self, owner: &str, entry: &Entry) -> Result<()> {
        let message_cid = entry.cid().map_err(|e| anyhow!("{e}"))?;
        lock(&self.inner.messages)
            .entry(owner.to_string())
            .or_default()
            .insert(message_cid, entry.clone());
        Ok(())
    }

    async fn query(&self, owner: &str, query: &Query) -> Result<(Vec<Entry>, Option<Cursor>)> {
        let entries = lock(&self.inner.messages)
            .get(owner)
            .map(|messages| messages.values().cloned().collect::<Vec<Entry>>())
            .unwrap_or_default();
        query.apply(&entries).map_err(|e| anyhow!("{e}"))
    }

    async fn get(&self, owner: &str, message_cid: &str) -> Result<Option<Entry>> {
        Ok(lock(&self.inner.messages)
            .get(owner)
            .and_then(|messages| messages.get(message_cid))
            .cloned())
    }

    async fn delete(&self, owner: &str, message_cid: &str) -> Result<()> {
        if let Some(messages) = lock(&self.inner.messages).get_mut(owner) {
            messages.remove(message_cid);
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        lock(&self.inner.messages).clear();
        Ok(())
    }
}

impl DataStore for ProviderImpl {
    async fn put(
        &self, owner: &str, record_id: &str, data_cid: &str, mut reader: impl Read + Send,
    ) -> Result<(String, usize)> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let (computed_cid, data_size) =
            dwn_engine::cid::from_reader(data.as_slice()).map_err(|e| anyhow!("{e}"))?;

        lock(&self.inner.data)
            .entry(owner.to_string())
            .or_default()
            .insert((record_id.to_string(), data_cid.to_string()), data);

        Ok((computed_cid, data_size))
    }

    async fn get(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.inner.data)
            .get(owner)
            .and_then(|data| data.get(&(record_id.to_string(), data_cid.to_string())))
            .cloned())
    }

    async fn associate(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<bool> {
        Ok(lock(&self.inner.data)
            .get(owner)
            .is_some_and(|data| data.contains_key(&(record_id.to_string(), data_cid.to_string()))))
    }

    async fn delete(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<()> {
        if let Some(data) = lock(&self.inner.data).get_mut(owner) {
            data.remove(&(record_id.to_string(), data_cid.to_string()));
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        lock(&self.inner.data).clear();
        Ok(())
    }
}

impl EventLog for ProviderImpl {
    async fn append(&self, owner: &str, event: &Event) -> Result<()> {
        let message_cid = event.cid().map_err(|e| anyhow!("{e}"))?;
        let mut events = lock(&self.inner.events);
        let log = events.entry(owner.to_string()).or_default();

        // appending is idempotent per message
        if !log.iter().any(|(cid, _)| cid == &message_cid) {
            log.push((message_cid, event.clone()));
        }
        Ok(())
    }

    async fn events(
        &self, owner: &str, cursor: Option<Cursor>,
    ) -> Result<(Vec<Event>, Option<Cursor>)> {
        let events = lock(&self.inner.events);
        let log = events.get(owner).cloned().unwrap_or_default();

        let skip = cursor
            .and_then(|cursor| log.iter().position(|(cid, _)| cid == &cursor.message_cid))
            .map_or(0, |position| position + 1);

        let entries: Vec<Event> = log[skip..].iter().map(|(_, event)| event.clone()).collect();
        let cursor = log.last().map(|(cid, _)| Cursor {
            message_cid: cid.clone(),
            value: String::new(),
        });

        Ok((entries, cursor))
    }

    async fn query(&self, owner: &str, query: &Query) -> Result<(Vec<Event>, Option<Cursor>)> {
        let events = lock(&self.inner.events);
        let log = events.get(owner).cloned().unwrap_or_default();

        let entries: Vec<Event> = log
            .iter()
            .filter(|(_, event)| query.is_match(event))
            .map(|(_, event)| event.clone())
            .collect();
        let cursor = log.last().map(|(cid, _)| Cursor {
            message_cid: cid.clone(),
            value: String::new(),
        });

        Ok((entries, cursor))
    }

    async fn delete(&self, owner: &str, message_cids: &[&str]) -> Result<()> {
        if let Some(log) = lock(&self.inner.events).get_mut(owner) {
            log.retain(|(cid, _)| !message_cids.contains(&cid.as_str()));
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        lock(&self.inner.events).clear();
        Ok(())
    }
}

impl EventStream for ProviderImpl {
    async fn subscribe(&self, owner: &str, filter: SubscribeFilter) -> Result<Subscriber> {
        let (sender, receiver) = mpsc::unbounded();
        let id = uuid::Uuid::new_v4().to_string();

        lock(&self.inner.subscribers)
            .entry(owner.to_string())
            .or_default()
            .push(SubscriberEntry { filter, sender });

        Ok(Subscriber::new(id, Box::pin(receiver)))
    }

    async fn emit(&self, owner: &str, event: &Event) -> Result<()> {
        let mut subscribers = lock(&self.inner.subscribers);
        let Some(entries) = subscribers.get_mut(owner) else {
            return Ok(());
        };

        // closed subscribers are dropped on first failed send
        entries.retain(|entry| {
            if !entry.filter.is_match(event) {
                return !entry.sender.is_closed();
            }
            entry.sender.unbounded_send(event.clone()).is_ok()
        });

        Ok(())
    }
}

impl TaskStore for ProviderImpl {
    async fn register(&self, owner: &str, task: &ResumableTask, timeout_secs: u64) -> Result<()> {
        lock(&self.inner.tasks)
            .entry(owner.to_string())
            .or_default()
            .insert(task.task_id.clone(), (task.clone(), now_secs() + timeout_secs));
        Ok(())
    }

    async fn grab(&self, owner: &str, count: u64) -> Result<Vec<ResumableTask>> {
        let mut tasks = lock(&self.inner.tasks);
        let Some(owner_tasks) = tasks.get_mut(owner) else {
            return Ok(vec![]);
        };

        let now = now_secs();
        let mut grabbed = vec![];

        for (task, grabbable_at) in owner_tasks.values_mut() {
            if grabbed.len() as u64 >= count {
                break;
            }
            if *grabbable_at <= now {
                task.retry_count += 1;
                *grabbable_at = now + 120;
                grabbed.push(task.clone());
            }
        }

        Ok(grabbed)
    }

    async fn read(&self, owner: &str, task_id: &str) -> Result<Option<ResumableTask>> {
        Ok(lock(&self.inner.tasks)
            .get(owner)
            .and_then(|tasks| tasks.get(task_id))
            .map(|(task, _)| task.clone()))
    }

    async fn extend(&self, owner: &str, task_id: &str, timeout_secs: u64) -> Result<()> {
        if let Some((_, grabbable_at)) =
            lock(&self.inner.tasks).get_mut(owner).and_then(|tasks| tasks.get_mut(task_id))
        {
            *grabbable_at = now_secs() + timeout_secs;
        }
        Ok(())
    }

    async fn delete(&self, owner: &str, task_id: &str) -> Result<()> {
        if let Some(tasks) = lock(&self.inner.tasks).get_mut(owner) {
            tasks.remove(task_id);
        }
        Ok(())
    }

    async fn purge(&self, owner: &str) -> Result<()> {
        lock(&self.inner.tasks).remove(owner);
        Ok(())
    }
}

impl DidResolver for ProviderImpl {
    async fn resolve(&self, did: &str) -> Result<Document> {
        did::resolve_key(did).map_err(|e| anyhow!("{e}"))
    }
}
