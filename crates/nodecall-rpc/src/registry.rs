use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use nodecall_codec::{Decode, Encode, Reader, Writer};
use parking_lot::RwLock;
use tracing::debug;

use crate::error::RegistryError;
use crate::function::{FnKey, FunctionEntry, FunctionId, RemoteFn, REPLY_FLAG, REPLY_ID};

type Result<T> = std::result::Result<T, RegistryError>;

static GLOBAL: LazyLock<Arc<FunctionRegistry>> =
    LazyLock::new(|| Arc::new(FunctionRegistry::new()));

/// Table of callable functions keyed by numeric ID.
///
/// IDs are handed out from 1 in registration order, so two processes that
/// register the same functions in the same order agree on every ID. Use
/// [`FunctionRegistry::register_with_id`] to pin IDs explicitly.
///
/// Outgoing calls find the ID from the function value itself. Fn items and
/// `fn` pointers both work; a pointer is matched by its address.
///
/// Lookups take a read lock and clone the entry out, so a function never
/// runs while the lock is held.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    inner: RwLock<Table>,
}

#[derive(Debug, Default)]
struct Table {
    by_id: BTreeMap<FunctionId, Arc<FunctionEntry>>,
    by_key: HashMap<FnKey, FunctionId>,
    next_id: FunctionId,
}

impl Table {
    fn check_free(&self, id: FunctionId, key: &FnKey) -> Result<()> {
        if id == REPLY_ID || id & REPLY_FLAG != 0 {
            return Err(RegistryError::ReservedId(id));
        }
        if let Some(existing) = self.by_key.get(key) {
            return Err(RegistryError::AlreadyRegistered(*existing));
        }
        if let Some(entry) = self.by_id.get(&id) {
            return Err(RegistryError::IdInUse {
                id,
                name: entry.name().to_string(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, entry: FunctionEntry) -> FunctionId {
        let id = entry.id();
        debug!(function = id, name = entry.name(), "function registered");
        self.by_key.insert(entry.key(), id);
        self.by_id.insert(id, Arc::new(entry));
        id
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<FunctionRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// Bind `f` under the next free ID.
    pub fn register<F, Args>(&self, name: impl Into<String>, f: F) -> Result<FunctionId>
    where
        F: RemoteFn<Args>,
        Args: Decode + 'static,
    {
        let key = FnKey::of(&f)?;
        let mut table = self.inner.write();
        let mut id = table.next_id.max(1);
        while table.by_id.contains_key(&id) {
            id += 1;
        }
        table.check_free(id, &key)?;
        table.next_id = id + 1;
        Ok(table.insert(FunctionEntry::new(id, name.into(), key, f)))
    }

    /// Bind `f` under an explicit ID.
    pub fn register_with_id<F, Args>(
        &self,
        id: FunctionId,
        name: impl Into<String>,
        f: F,
    ) -> Result<FunctionId>
    where
        F: RemoteFn<Args>,
        Args: Decode + 'static,
    {
        let key = FnKey::of(&f)?;
        let mut table = self.inner.write();
        table.check_free(id, &key)?;
        Ok(table.insert(FunctionEntry::new(id, name.into(), key, f)))
    }

    pub fn get(&self, id: FunctionId) -> Option<Arc<FunctionEntry>> {
        self.inner.read().by_id.get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<FunctionEntry>> {
        self.inner
            .read()
            .by_id
            .values()
            .find(|entry| entry.name() == name)
            .cloned()
    }

    /// ID bound to the function value `f`.
    pub fn id_of<F, Args>(&self, f: &F) -> Option<FunctionId>
    where
        F: RemoteFn<Args>,
    {
        let key = FnKey::of(f).ok()?;
        self.inner.read().by_key.get(&key).copied()
    }

    pub fn entry_of<F, Args>(&self, f: &F) -> Option<Arc<FunctionEntry>>
    where
        F: RemoteFn<Args>,
    {
        self.id_of(f).and_then(|id| self.get(id))
    }

    /// Start a call payload: `[id][args]`.
    ///
    /// The argument tuple must match what `f` accepts, checked at compile
    /// time. More bytes may be appended to the returned writer.
    pub fn prepare_call<F, Args>(&self, f: &F, args: Args) -> Result<Writer>
    where
        F: RemoteFn<Args>,
        Args: Encode,
    {
        let id = self.id_of(f).ok_or(RegistryError::NotRegistered)?;
        Ok(Self::payload(id, &args))
    }

    /// Like [`FunctionRegistry::prepare_call`], with the reply bit set so the
    /// callee sends the return value back.
    pub fn prepare_call_with_reply<F, Args>(&self, f: &F, args: Args) -> Result<Writer>
    where
        F: RemoteFn<Args>,
        Args: Encode,
    {
        let id = self.id_of(f).ok_or(RegistryError::NotRegistered)?;
        Ok(Self::payload(id | REPLY_FLAG, &args))
    }

    fn payload<Args: Encode>(id: u32, args: &Args) -> Writer {
        let mut writer = Writer::new();
        writer.write(&id).write(args);
        writer
    }

    /// Read the leading function ID from `reader` and invoke that function.
    pub fn call(&self, reader: &mut Reader<'_>) -> Result<FunctionId> {
        let id = reader.read::<FunctionId>()?;
        self.invoke(id, reader)?;
        Ok(id)
    }

    /// Read the leading function ID, invoke the function and encode its
    /// return value into `writer`.
    pub fn call_with_return(
        &self,
        reader: &mut Reader<'_>,
        writer: &mut Writer,
    ) -> Result<FunctionId> {
        let id = reader.read::<FunctionId>()?;
        self.invoke_with_return(id, reader, writer)?;
        Ok(id)
    }

    /// Invoke function `id` with arguments read from `reader`.
    pub fn invoke(&self, id: FunctionId, reader: &mut Reader<'_>) -> Result<()> {
        let entry = self.get(id).ok_or(RegistryError::UnknownFunction(id))?;
        entry.invoke(reader)
    }

    pub fn invoke_with_return(
        &self,
        id: FunctionId,
        reader: &mut Reader<'_>,
        writer: &mut Writer,
    ) -> Result<()> {
        let entry = self.get(id).ok_or(RegistryError::UnknownFunction(id))?;
        entry.invoke_with_return(reader, writer)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(id, name)` of every registered function, by ID.
    pub fn functions(&self) -> Vec<(FunctionId, String)> {
        self.inner
            .read()
            .by_id
            .values()
            .map(|entry| (entry.id(), entry.name().to_string()))
            .collect()
    }
}
