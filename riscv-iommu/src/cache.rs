//! The translation context cache (spec §3, §4.3, §5).
//!
//! The cache's backing map is an `Arc<HashMap<..>>` behind a `Mutex`. A
//! reader that looked the map up before an overflow replacement keeps its own
//! `Arc` clone alive via ordinary reference counting — no bespoke
//! reference-counted-map type is needed, `Arc`'s own semantics satisfy spec
//! §5's requirement that "in-flight readers continue to observe the old
//! snapshot safely".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::context::Ctx;
use crate::walker::WalkFault;

/// Bound on the number of live entries before the cache is replaced wholesale
/// (spec §3, §8 invariant 3).
pub const MAX_ENTRIES: usize = 128;

type Key = (u32, u32);
type Map = HashMap<Key, Ctx>;

/// A reference to the map snapshot a lookup was served from. Keeping this
/// alive keeps that snapshot's entries alive even if the live cache is
/// replaced out from under it by a concurrent overflow (spec §5).
#[derive(Clone)]
pub struct Snapshot(Arc<Map>);

/// Selects which entries `invalidate` clears the `V` bit on (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateSelector {
    All,
    Device(u32),
    DeviceProcess(u32, u32),
}

pub struct ContextCache {
    inner: Mutex<Arc<Map>>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Arc::new(Map::new())),
        }
    }

    fn snapshot(&self) -> Arc<Map> {
        self.inner.lock().expect("ctx_lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Look up `{devid, process_id}` under the lock. On a hit with `V` set,
    /// return the cached context and a [`Snapshot`] handle extending the
    /// lifetime of the map it came from. On a miss (or a hit with `V`
    /// clear), run `fetch` *outside* the lock, then re-acquire it to insert
    /// the freshly walked context, recycling the map first if it is full.
    pub fn get_or_fetch(
        &self,
        devid: u32,
        process_id: u32,
        fetch: impl FnOnce() -> Result<Ctx, WalkFault>,
    ) -> Result<(Ctx, Snapshot), WalkFault> {
        {
            let snap = self.snapshot();
            if let Some(ctx) = snap.get(&(devid, process_id)) {
                if ctx.is_valid() {
                    return Ok((*ctx, Snapshot(snap)));
                }
            }
        }

        let ctx = fetch()?;

        let mut guard = self.inner.lock().expect("ctx_lock poisoned");
        if guard.len() >= MAX_ENTRIES {
            tracing::debug!(
                size = guard.len(),
                "context cache at bound; replacing wholesale"
            );
            *guard = Arc::new(Map::new());
        }
        let mut next = (**guard).clone();
        next.insert((devid, process_id), ctx);
        let next = Arc::new(next);
        *guard = next.clone();
        Ok((ctx, Snapshot(next)))
    }

    /// Clear the `V` bit on every entry matched by `selector` (spec §4.3: the
    /// entry is retained until the next natural eviction/overflow).
    pub fn invalidate(&self, selector: InvalidateSelector) {
        let mut guard = self.inner.lock().expect("ctx_lock poisoned");
        if guard.is_empty() {
            return;
        }
        let mut next = (**guard).clone();
        for ctx in next.values_mut() {
            let matches = match selector {
                InvalidateSelector::All => true,
                InvalidateSelector::Device(devid) => ctx.devid == devid,
                InvalidateSelector::DeviceProcess(devid, process_id) => {
                    ctx.devid == devid && ctx.process_id == process_id
                }
            };
            if matches {
                ctx.invalidate();
            }
        }
        *guard = Arc::new(next);
    }
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new()
    }
}
