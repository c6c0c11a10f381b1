//! Modules and the programs resolved from them.
//!
//! A [`Module`] wraps compiled device code. [`Module::at`] resolves an entry
//! point by name into a [`Program`], classifying it by the entry's prefix
//! (`__raygen__`, `__miss__`, ...). Programs are cached per module: a lookup
//! while any clone of an earlier result is alive returns that same program,
//! otherwise the program group is created again.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::backend::{
    EntryPoint, ModuleCompileOptions, ModuleHandle, ModuleSource, PipelineCompileOptions,
    ProgramGroupDesc, ProgramGroupHandle,
};
use crate::context::{DeviceContext, LogLevel};
use crate::error::{Result, RtError, Status};
use crate::sbt::SbtHeader;

/// Role of a program in a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Raygen,
    Miss,
    AnyHit,
    ClosestHit,
    Intersection,
    Exception,
    DirectCallable,
    ContinuationCallable,
    /// Intersection, closest-hit and any-hit programs combined.
    HitGroup,
    /// Direct and continuation callables combined.
    CallableGroup,
}

const ENTRY_PREFIXES: [(&str, ProgramKind); 8] = [
    ("__raygen__", ProgramKind::Raygen),
    ("__miss__", ProgramKind::Miss),
    ("__anyhit__", ProgramKind::AnyHit),
    ("__closesthit__", ProgramKind::ClosestHit),
    ("__intersection__", ProgramKind::Intersection),
    ("__exception__", ProgramKind::Exception),
    ("__direct_callable__", ProgramKind::DirectCallable),
    ("__continuation_callable__", ProgramKind::ContinuationCallable),
];

impl ProgramKind {
    /// Classify an entry point by its name prefix. The longest matching
    /// prefix wins; the rest of the name is not interpreted.
    pub fn from_entry_name(name: &str) -> Option<Self> {
        ENTRY_PREFIXES
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|&(_, kind)| kind)
    }

    /// Entry name prefix of a single-entry kind.
    pub fn prefix(self) -> Option<&'static str> {
        ENTRY_PREFIXES
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|&(prefix, _)| prefix)
    }

    /// Group description of a single entry point. `None` for the group
    /// kinds, which only come from [`Program::combine`].
    fn group_desc(self, entry: EntryPoint) -> Option<ProgramGroupDesc> {
        let desc = match self {
            Self::Raygen => ProgramGroupDesc::Raygen(entry),
            Self::Miss => ProgramGroupDesc::Miss(entry),
            Self::Exception => ProgramGroupDesc::Exception(entry),
            Self::ClosestHit => ProgramGroupDesc::HitGroup {
                closest_hit: Some(entry),
                any_hit: None,
                intersection: None,
            },
            Self::AnyHit => ProgramGroupDesc::HitGroup {
                closest_hit: None,
                any_hit: Some(entry),
                intersection: None,
            },
            Self::Intersection => ProgramGroupDesc::HitGroup {
                closest_hit: None,
                any_hit: None,
                intersection: Some(entry),
            },
            Self::DirectCallable => ProgramGroupDesc::Callables {
                direct: Some(entry),
                continuation: None,
            },
            Self::ContinuationCallable => ProgramGroupDesc::Callables {
                direct: None,
                continuation: Some(entry),
            },
            Self::HitGroup | Self::CallableGroup => return None,
        };
        Some(desc)
    }
}

/// Index and generation of a cache slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SlotKey {
    index: usize,
    generation: u64,
}

struct Slot {
    name: String,
    generation: u64,
    /// Live [`Program`] values referring to this slot.
    owners: usize,
    program: Arc<ProgramInner>,
}

#[derive(Default)]
struct CacheState {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    by_name: HashMap<String, usize>,
    next_generation: u64,
}

/// Programs of one module, keyed by entry name.
///
/// Each slot counts the [`Program`] values referring to it; the last one
/// dropped evicts the slot.
#[derive(Default)]
pub(crate) struct ProgramCache {
    state: Mutex<CacheState>,
}

impl ProgramCache {
    /// The cached program for `name`, adding an owner.
    fn lookup(&self, name: &str) -> Option<(Arc<ProgramInner>, SlotKey)> {
        let mut state = self.state.lock();
        let index = *state.by_name.get(name)?;
        let slot = state.slots[index].as_mut()?;
        slot.owners += 1;
        Some((
            Arc::clone(&slot.program),
            SlotKey {
                index,
                generation: slot.generation,
            },
        ))
    }

    /// Insert a freshly created program unless another thread got there
    /// first, in which case the cached one is returned along with the
    /// rejected program.
    fn insert(
        &self,
        name: &str,
        program: Arc<ProgramInner>,
    ) -> (Arc<ProgramInner>, SlotKey, Option<Arc<ProgramInner>>) {
        let mut state = self.state.lock();
        if let Some(&index) = state.by_name.get(name) {
            if let Some(slot) = state.slots[index].as_mut() {
                slot.owners += 1;
                let key = SlotKey {
                    index,
                    generation: slot.generation,
                };
                return (Arc::clone(&slot.program), key, Some(program));
            }
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        let slot = Slot {
            name: name.to_string(),
            generation,
            owners: 1,
            program: Arc::clone(&program),
        };
        let index = if let Some(index) = state.free.pop() {
            state.slots[index] = Some(slot);
            index
        } else {
            state.slots.push(Some(slot));
            state.slots.len() - 1
        };
        state.by_name.insert(name.to_string(), index);
        (program, SlotKey { index, generation }, None)
    }

    fn acquire(&self, key: SlotKey) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots[key.index].as_mut() {
            if slot.generation == key.generation {
                slot.owners += 1;
            }
        }
    }

    /// Drop an owner. Returns the evicted program so it is destroyed after
    /// the lock is released.
    fn release(&self, key: SlotKey) -> Option<Arc<ProgramInner>> {
        let mut state = self.state.lock();
        let slot = state.slots[key.index]
            .as_mut()
            .filter(|slot| slot.generation == key.generation)?;
        slot.owners -= 1;
        if slot.owners > 0 {
            return None;
        }
        let slot = state.slots[key.index].take()?;
        state.by_name.remove(&slot.name);
        state.free.push(key.index);
        Some(slot.program)
    }

    /// Number of cached programs.
    fn len(&self) -> usize {
        self.state.lock().by_name.len()
    }
}

struct ModuleInner {
    context: DeviceContext,
    handle: ModuleHandle,
    cache: ProgramCache,
}

impl Drop for ModuleInner {
    fn drop(&mut self) {
        self.context.backend().module_destroy(self.handle);
    }
}

/// Compiled device code.
///
/// Cloning is cheap. Programs keep their module alive.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    pub(crate) fn new(
        context: &DeviceContext,
        source: &ModuleSource,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
    ) -> Result<Self> {
        let handle = context
            .backend()
            .module_create(source, module_options, pipeline_options)
            .map_err(|e| {
                let e = if e.status() == Status::Internal {
                    e.with_status(Status::ModuleCreationFailed)
                } else {
                    e
                };
                context.log(LogLevel::Error, &format!("Failed to create module: {e}"));
                e.context(context.device_id(), "create_module")
            })?;
        tracing::info!(
            "Created module {source:?} on device {}",
            context.device_id()
        );
        Ok(Self {
            inner: Arc::new(ModuleInner {
                context: context.clone(),
                handle,
                cache: ProgramCache::default(),
            }),
        })
    }

    pub fn context(&self) -> &DeviceContext {
        &self.inner.context
    }

    /// Backend handle of the module.
    pub fn handle(&self) -> ModuleHandle {
        self.inner.handle
    }

    /// Number of programs currently held by some owner.
    pub fn cached_programs(&self) -> usize {
        self.inner.cache.len()
    }

    /// Resolve the entry point `name` into a program.
    ///
    /// Returns `None`, after logging why, for an empty name, a name without
    /// a known prefix, or an entry point the module does not contain.
    pub fn at(&self, name: &str) -> Option<Program> {
        let context = &self.inner.context;
        if name.is_empty() {
            context.log(LogLevel::Error, "Program lookup with an empty name");
            return None;
        }
        let Some(kind) = ProgramKind::from_entry_name(name) else {
            context.log(
                LogLevel::Error,
                &format!("Program '{name}' has no known entry prefix"),
            );
            return None;
        };
        if let Some((inner, key)) = self.inner.cache.lookup(name) {
            return Some(Program {
                inner,
                cache: Some((Arc::clone(&self.inner), key)),
            });
        }

        let created = match self.create_program(kind, name) {
            Ok(inner) => inner,
            Err(e) => {
                context.log(
                    LogLevel::Error,
                    &format!("Failed to create program '{name}': {e}"),
                );
                return None;
            }
        };
        let (inner, key, rejected) = self.inner.cache.insert(name, Arc::new(created));
        drop(rejected);
        Some(Program {
            inner,
            cache: Some((Arc::clone(&self.inner), key)),
        })
    }

    fn create_program(&self, kind: ProgramKind, name: &str) -> Result<ProgramInner> {
        let entry = EntryPoint {
            module: self.inner.handle,
            name: name.to_string(),
        };
        let desc = kind
            .group_desc(entry.clone())
            .ok_or_else(|| RtError::invalid_value(format!("{kind:?} is not an entry kind")))?;
        let backend = self.inner.context.backend();
        let group = backend.program_group_create(&desc)?;
        let header = match backend.sbt_record_pack_header(group) {
            Ok(header) => header,
            Err(e) => {
                backend.program_group_destroy(group);
                return Err(e);
            }
        };
        tracing::debug!("Created {kind:?} program '{name}'");
        Ok(ProgramInner {
            context: self.inner.context.clone(),
            kind,
            name: name.to_string(),
            group,
            header,
            entry: Some(entry),
            module: Some(Arc::clone(&self.inner)),
            members: Vec::new(),
        })
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("handle", &self.inner.handle)
            .field("cached_programs", &self.cached_programs())
            .finish()
    }
}

struct ProgramInner {
    context: DeviceContext,
    kind: ProgramKind,
    name: String,
    group: ProgramGroupHandle,
    header: SbtHeader,
    entry: Option<EntryPoint>,
    /// Keeps the module alive while its program group exists.
    module: Option<Arc<ModuleInner>>,
    /// Programs a group was combined from.
    members: Vec<Program>,
}

impl Drop for ProgramInner {
    fn drop(&mut self) {
        self.context.backend().program_group_destroy(self.group);
    }
}

/// A program group with its binding table header.
///
/// Programs are immutable. Clones refer to the same program, and
/// [`Program::ptr_eq`] tells whether two values do.
pub struct Program {
    inner: Arc<ProgramInner>,
    cache: Option<(Arc<ModuleInner>, SlotKey)>,
}

impl Program {
    pub fn kind(&self) -> ProgramKind {
        self.inner.kind
    }

    /// Entry name, or the member names joined by `+` for a group.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Header to copy into binding table records. Fixed at creation.
    pub fn header(&self) -> &SbtHeader {
        &self.inner.header
    }

    pub fn context(&self) -> &DeviceContext {
        &self.inner.context
    }

    /// Whether both values refer to the same program.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn group(&self) -> ProgramGroupHandle {
        self.inner.group
    }

    /// Combine programs into one group.
    ///
    /// Intersection, closest-hit and any-hit programs form a
    /// [`ProgramKind::HitGroup`] with at most one program of each kind.
    /// Direct and continuation callables form a
    /// [`ProgramKind::CallableGroup`] likewise. Anything else is rejected.
    pub fn combine(programs: &[Self]) -> Result<Self> {
        let Some(first) = programs.first() else {
            return Err(RtError::invalid_value("no programs to combine"));
        };
        let context = first.context().clone();
        let result = Self::combine_inner(&context, programs);
        if let Err(e) = &result {
            context.log(LogLevel::Error, &format!("Failed to combine programs: {e}"));
        }
        result.map_err(|e| e.context(context.device_id(), "combine"))
    }

    fn combine_inner(context: &DeviceContext, programs: &[Self]) -> Result<Self> {
        let mut closest_hit = None;
        let mut any_hit = None;
        let mut intersection = None;
        let mut direct = None;
        let mut continuation = None;
        for program in programs {
            if !program.context().same_as(context) {
                return Err(RtError::invalid_value(format!(
                    "program '{}' belongs to another context",
                    program.name()
                )));
            }
            let entry = program.inner.entry.clone().ok_or_else(|| {
                RtError::invalid_value(format!("'{}' is already a group", program.name()))
            })?;
            let slot = match program.kind() {
                ProgramKind::ClosestHit => &mut closest_hit,
                ProgramKind::AnyHit => &mut any_hit,
                ProgramKind::Intersection => &mut intersection,
                ProgramKind::DirectCallable => &mut direct,
                ProgramKind::ContinuationCallable => &mut continuation,
                kind => {
                    return Err(RtError::invalid_value(format!(
                        "{kind:?} program '{}' cannot be combined",
                        program.name()
                    )))
                }
            };
            if slot.replace(entry).is_some() {
                return Err(RtError::invalid_value(format!(
                    "more than one {:?} program",
                    program.kind()
                )));
            }
        }

        let is_hit = closest_hit.is_some() || any_hit.is_some() || intersection.is_some();
        let is_callable = direct.is_some() || continuation.is_some();
        let (kind, desc) = match (is_hit, is_callable) {
            (true, false) => (
                ProgramKind::HitGroup,
                ProgramGroupDesc::HitGroup {
                    closest_hit,
                    any_hit,
                    intersection,
                },
            ),
            (false, true) => (
                ProgramKind::CallableGroup,
                ProgramGroupDesc::Callables {
                    direct,
                    continuation,
                },
            ),
            _ => {
                return Err(RtError::invalid_value(
                    "hit and callable programs cannot share a group",
                ))
            }
        };

        let backend = context.backend();
        let group = backend.program_group_create(&desc)?;
        let header = match backend.sbt_record_pack_header(group) {
            Ok(header) => header,
            Err(e) => {
                backend.program_group_destroy(group);
                return Err(e);
            }
        };
        let name = programs
            .iter()
            .map(Self::name)
            .collect::<Vec<_>>()
            .join("+");
        tracing::debug!("Combined {kind:?} program '{name}'");
        Ok(Self {
            inner: Arc::new(ProgramInner {
                context: context.clone(),
                kind,
                name,
                group,
                header,
                entry: None,
                module: None,
                members: programs.to_vec(),
            }),
            cache: None,
        })
    }
}

impl Clone for Program {
    fn clone(&self) -> Self {
        if let Some((module, key)) = &self.cache {
            module.cache.acquire(*key);
        }
        Self {
            inner: Arc::clone(&self.inner),
            cache: self.cache.clone(),
        }
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Some((module, key)) = &self.cache {
            // Destroyed here, outside the cache lock
            let evicted = module.cache.release(*key);
            drop(evicted);
        }
    }
}

impl PartialEq for Program {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Program {}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("kind", &self.inner.kind)
            .field("name", &self.inner.name)
            .field("members", &self.inner.members.len())
            .field("module", &self.inner.module.as_ref().map(|m| m.handle))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostProgramImage;
    use photon_gpu::HostDeviceBuilder;

    fn module() -> Module {
        let device = HostDeviceBuilder::new().build().unwrap();
        let context = DeviceContext::create(device.as_ref()).unwrap();
        let image = HostProgramImage::builder("test")
            .raygen("__raygen__foo", |_| {})
            .miss("__miss__", |_| {})
            .closest_hit("__closesthit__hit", |_| {})
            .any_hit("__anyhit__hit", |_| {})
            .intersection("__intersection__box", |_| {})
            .exception("__exception__", |_, _| {})
            .direct_callable("__direct_callable__f", |_, _| {})
            .continuation_callable("__continuation_callable__g", |_, _| {})
            .build();
        context
            .create_module(
                ModuleSource::Host(image),
                &ModuleCompileOptions::default(),
                &PipelineCompileOptions::default(),
            )
            .unwrap()
    }

    #[test]
    fn prefixes_resolve_to_kinds() {
        let cases = [
            ("__raygen__foo", ProgramKind::Raygen),
            ("__miss__", ProgramKind::Miss),
            ("__closesthit__hit", ProgramKind::ClosestHit),
            ("__anyhit__hit", ProgramKind::AnyHit),
            ("__intersection__box", ProgramKind::Intersection),
            ("__exception__", ProgramKind::Exception),
            ("__direct_callable__f", ProgramKind::DirectCallable),
            ("__continuation_callable__g", ProgramKind::ContinuationCallable),
        ];
        let module = module();
        for (name, kind) in cases {
            assert_eq!(ProgramKind::from_entry_name(name), Some(kind));
            assert_eq!(module.at(name).map(|p| p.kind()), Some(kind), "{name}");
        }
        assert_eq!(ProgramKind::from_entry_name("__raygen"), None);
        assert_eq!(ProgramKind::Raygen.prefix(), Some("__raygen__"));
        assert_eq!(ProgramKind::HitGroup.prefix(), None);
    }

    #[test]
    fn every_prefix_names_an_entry_kind() {
        let entry = EntryPoint {
            module: ModuleHandle(1),
            name: String::new(),
        };
        for (prefix, kind) in ENTRY_PREFIXES {
            assert_eq!(ProgramKind::from_entry_name(prefix), Some(kind));
            assert!(kind.group_desc(entry.clone()).is_some(), "{prefix}");
        }
        for kind in [ProgramKind::HitGroup, ProgramKind::CallableGroup] {
            assert!(kind.group_desc(entry.clone()).is_none());
            assert!(ENTRY_PREFIXES.iter().all(|&(_, k)| k != kind));
        }
    }

    #[test]
    fn lookup_is_cached_while_held() {
        let module = module();
        let first = module.at("__raygen__foo").unwrap();
        let second = module.at("__raygen__foo").unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(module.cached_programs(), 1);

        let header = *first.header();
        drop(first);
        drop(second);
        assert_eq!(module.cached_programs(), 0);

        let third = module.at("__raygen__foo").unwrap();
        assert_eq!(*third.header(), header);
    }

    #[test]
    fn clones_keep_the_slot_alive() {
        let module = module();
        let first = module.at("__miss__").unwrap();
        let clone = first.clone();
        drop(first);
        let again = module.at("__miss__").unwrap();
        assert!(again.ptr_eq(&clone));
    }

    #[test]
    fn bad_names_return_none() {
        let module = module();
        assert!(module.at("").is_none());
        assert!(module.at("unknown_prefix").is_none());
        assert!(module.at("__raygen__missing").is_none());
        assert_eq!(module.cached_programs(), 0);
    }

    #[test]
    fn distinct_suffixes_are_distinct_programs() {
        let module = module();
        let hit = module.at("__closesthit__hit").unwrap();
        let any = module.at("__anyhit__hit").unwrap();
        assert!(!hit.ptr_eq(&any));
        assert_eq!(module.cached_programs(), 2);
    }

    #[test]
    fn combine_builds_groups() {
        let module = module();
        let closest = module.at("__closesthit__hit").unwrap();
        let intersection = module.at("__intersection__box").unwrap();
        let group = Program::combine(&[intersection.clone(), closest.clone()]).unwrap();
        assert_eq!(group.kind(), ProgramKind::HitGroup);
        assert_eq!(group.name(), "__intersection__box+__closesthit__hit");

        let error = Program::combine(&[closest.clone(), closest]).unwrap_err();
        assert_eq!(error.status(), Status::InvalidValue);

        let raygen = module.at("__raygen__foo").unwrap();
        assert!(Program::combine(&[raygen]).is_err());

        let direct = module.at("__direct_callable__f").unwrap();
        assert!(Program::combine(&[direct.clone(), intersection]).is_err());
        let callables = Program::combine(&[direct]).unwrap();
        assert_eq!(callables.kind(), ProgramKind::CallableGroup);
    }
}
