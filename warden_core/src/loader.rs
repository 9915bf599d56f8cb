use crate::error::{DispatchError, TransformError, WorkerError};
use crate::executor::TargetFault;
use crate::instrument::InstrumentationStrategy;
use crate::runtime::{LoadedUnit, UnitOrigin};
use crate::unit::{UNIT_EXTENSION, UnitFormatError, decode_unit};
use crate::vm::{Completion, ExecutionLimits, Machine};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use thiserror::Error;

/// Errors raised while resolving, transforming or initializing a unit.
#[derive(Error, Debug)]
pub enum LoadError {
    /// No file for the unit exists under any user or dependency path.
    #[error("unit {0} not found on the configured paths")]
    NotFound(String),

    /// The unit file exists but could not be read.
    #[error("failed to read unit {unit} from {path:?}: {reason}")]
    Read {
        unit: String,
        path: PathBuf,
        reason: String,
    },

    /// The load hook rejected the binary.
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// The (possibly transformed) binary does not parse or fails validation.
    #[error("unit {unit} is malformed: {source}")]
    Malformed {
        unit: String,
        source: UnitFormatError,
    },

    /// The file at the resolved path declares another unit.
    #[error("file for unit {expected} declares {found}")]
    NameMismatch { expected: String, found: String },

    /// The unit's `<clinit>` raised a target fault. The unit stays unloaded.
    #[error("initializer of {unit} raised {fault}")]
    Initializer { unit: String, fault: TargetFault },

    /// The unit's `<clinit>` executed `Halt`.
    #[error("initializer of {unit} requested exit with code {code}")]
    Exited { unit: String, code: i32 },
}

impl From<LoadError> for WorkerError {
    fn from(err: LoadError) -> Self {
        let reason = err.to_string();
        match err {
            LoadError::NotFound(unit) => DispatchError::UnitNotFound { unit }.into(),
            LoadError::Transform(e) => WorkerError::Transform(e),
            LoadError::Read { unit, .. }
            | LoadError::Malformed { unit, .. }
            | LoadError::Initializer { unit, .. }
            | LoadError::Exited { unit, .. }
            | LoadError::NameMismatch { expected: unit, .. } => {
                DispatchError::UnitLoad { unit, reason }.into()
            }
        }
    }
}

/// Resolves dotted unit names against ordered search paths and keeps every
/// unit it loaded for the lifetime of the worker.
///
/// Lookup tries user paths first, then dependency paths; the first existing
/// file wins. The instrumentation hook, once installed, applies to units
/// found under user paths only. A unit is registered before its initializer
/// runs, so the initializer and any cyclic reference from it see the unit
/// rather than triggering a second load.
pub struct UnitLoader {
    user_paths: Vec<PathBuf>,
    dependency_paths: Vec<PathBuf>,
    hook: Option<Rc<dyn InstrumentationStrategy>>,
    units: HashMap<String, Rc<LoadedUnit>>,
    limits: ExecutionLimits,
}

impl UnitLoader {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            user_paths: Vec::new(),
            dependency_paths: Vec::new(),
            hook: None,
            units: HashMap::new(),
            limits,
        }
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// Appends search paths, skipping ones already present.
    pub fn add_paths<U, D>(&mut self, user_paths: U, dependency_paths: D)
    where
        U: IntoIterator<Item = PathBuf>,
        D: IntoIterator<Item = PathBuf>,
    {
        for path in user_paths {
            if !self.user_paths.contains(&path) {
                self.user_paths.push(path);
            }
        }
        for path in dependency_paths {
            if !self.dependency_paths.contains(&path) {
                self.dependency_paths.push(path);
            }
        }
    }

    pub fn user_paths(&self) -> &[PathBuf] {
        &self.user_paths
    }

    pub fn dependency_paths(&self) -> &[PathBuf] {
        &self.dependency_paths
    }

    /// Units loaded before this call are not retransformed.
    pub fn install_hook(&mut self, strategy: Rc<dyn InstrumentationStrategy>) {
        self.hook = Some(strategy);
    }

    pub fn loaded(&self, name: &str) -> Option<Rc<LoadedUnit>> {
        self.units.get(name).cloned()
    }

    pub fn loaded_count(&self) -> usize {
        self.units.len()
    }

    pub fn resolve(&self, name: &str) -> Option<(PathBuf, UnitOrigin)> {
        let relative = unit_relative_path(name)?;
        self.user_paths
            .iter()
            .map(|root| (root, UnitOrigin::User))
            .chain(
                self.dependency_paths
                    .iter()
                    .map(|root| (root, UnitOrigin::Dependency)),
            )
            .map(|(root, origin)| (root.join(&relative), origin))
            .find(|(path, _)| path.is_file())
    }

    pub fn load(&mut self, name: &str) -> Result<Rc<LoadedUnit>, LoadError> {
        if let Some(unit) = self.units.get(name) {
            return Ok(Rc::clone(unit));
        }

        let (path, origin) = self
            .resolve(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        let original = fs::read(&path).map_err(|e| LoadError::Read {
            unit: name.to_string(),
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let digest = md5::compute(&original);

        let hook = match origin {
            UnitOrigin::User => self.hook.clone(),
            UnitOrigin::Dependency => None,
        };
        let (binary, layout) = match hook {
            Some(strategy) => {
                let transformed = strategy.transform(&original, name)?;
                (transformed.binary, transformed.layout)
            }
            None => (original, None),
        };

        let malformed = |source| LoadError::Malformed {
            unit: name.to_string(),
            source,
        };
        let class = decode_unit(&binary).map_err(malformed)?;
        if class.name != name {
            return Err(LoadError::NameMismatch {
                expected: name.to_string(),
                found: class.name,
            });
        }
        class.validate().map_err(malformed)?;

        let unit = Rc::new(LoadedUnit::new(class, layout));
        self.units.insert(name.to_string(), Rc::clone(&unit));

        if let Some(index) = unit.class().initializer_index() {
            let completion = Machine::new(self).run(&unit, index, Vec::new());
            match completion {
                Completion::Returned(_) => {}
                Completion::Faulted(fault) => {
                    self.units.remove(name);
                    return Err(LoadError::Initializer {
                        unit: name.to_string(),
                        fault,
                    });
                }
                Completion::Exited(code) => {
                    self.units.remove(name);
                    return Err(LoadError::Exited {
                        unit: name.to_string(),
                        code,
                    });
                }
            }
        }

        log::debug!(
            "loaded {} from {} ({:?}, md5 {:x})",
            name,
            path.display(),
            origin,
            digest
        );
        Ok(unit)
    }

    /// Every unit name present under the user paths, sorted.
    pub fn discover(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for root in &self.user_paths {
            let mut pending = vec![root.clone()];
            while let Some(dir) = pending.pop() {
                let entries = match fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(e) => {
                        log::warn!("skipping unreadable directory {}: {}", dir.display(), e);
                        continue;
                    }
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        pending.push(path);
                    } else if path.extension().and_then(|e| e.to_str()) == Some(UNIT_EXTENSION) {
                        if let Some(name) = unit_name_for(root, &path) {
                            names.insert(name);
                        }
                    }
                }
            }
        }
        names.into_iter().collect()
    }
}

/// `a.b.C` -> `a/b/C.wunit`.
pub fn unit_relative_path(name: &str) -> Option<PathBuf> {
    let segments: Vec<&str> = name.split('.').collect();
    if segments
        .iter()
        .any(|s| s.is_empty() || s.contains(['/', '\\']))
    {
        return None;
    }
    let (last, dirs) = segments.split_last()?;
    let mut path: PathBuf = dirs.iter().collect();
    path.push(format!("{last}.{UNIT_EXTENSION}"));
    Some(path)
}

fn unit_name_for(root: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(root).ok()?.with_extension("");
    let segments = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if segments.is_empty() || segments.iter().any(|s| s.is_empty() || s.contains('.')) {
        return None;
    }
    Some(segments.join("."))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::instrument::{self, InstrumentationKind};
    use crate::runtime::FieldAccessor;
    use crate::unit::tests::{calc_unit, method};
    use crate::unit::{ClassFile, FieldDef, INITIALIZER_NAME, Insn, Visibility, encode_unit};
    use crate::value::{Value, ValueType};
    use crate::vm::OUT_OF_MEMORY;
    use tempfile::tempdir;

    pub(crate) fn write_unit(root: &Path, class: &ClassFile) -> PathBuf {
        let path = root.join(unit_relative_path(&class.name).expect("valid unit name"));
        fs::create_dir_all(path.parent().expect("has parent")).expect("create unit dir");
        fs::write(&path, encode_unit(class).expect("encode")).expect("write unit");
        path
    }

    fn loader_for(user: &Path, deps: &Path) -> UnitLoader {
        let mut loader = UnitLoader::new(ExecutionLimits::default());
        loader.add_paths([user.to_path_buf()], [deps.to_path_buf()]);
        loader
    }

    fn with_initializer(name: &str, code: Vec<Insn>) -> ClassFile {
        ClassFile {
            name: name.to_string(),
            fields: vec![FieldDef {
                name: "ready".into(),
                ty: ValueType::Bool,
                visibility: Visibility::Public,
                initial: None,
            }],
            methods: vec![method(INITIALIZER_NAME, vec![], ValueType::Void, code)],
        }
    }

    #[test]
    fn relative_paths_follow_dotted_names() {
        assert_eq!(
            unit_relative_path("a.b.C"),
            Some(PathBuf::from("a").join("b").join("C.wunit"))
        );
        assert_eq!(unit_relative_path("a..C"), None);
        assert_eq!(unit_relative_path("a/b.C"), None);
    }

    #[test]
    fn user_paths_shadow_dependency_paths() {
        let user = tempdir().unwrap();
        let deps = tempdir().unwrap();
        write_unit(user.path(), &calc_unit());
        write_unit(deps.path(), &calc_unit());
        let loader = loader_for(user.path(), deps.path());
        let (_, origin) = loader.resolve("demo.Calc").expect("resolved");
        assert_eq!(origin, UnitOrigin::User);
    }

    #[test]
    fn missing_unit_is_not_found() {
        let user = tempdir().unwrap();
        let deps = tempdir().unwrap();
        let mut loader = loader_for(user.path(), deps.path());
        assert!(matches!(loader.load("demo.Nope"), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn unit_file_declaring_another_name_is_rejected() {
        let user = tempdir().unwrap();
        let deps = tempdir().unwrap();
        let mut other = calc_unit();
        other.name = "demo.Other".into();
        let path = user.path().join("demo").join("Calc.wunit");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, encode_unit(&other).unwrap()).unwrap();
        let mut loader = loader_for(user.path(), deps.path());
        assert!(matches!(
            loader.load("demo.Calc"),
            Err(LoadError::NameMismatch { .. })
        ));
    }

    #[test]
    fn garbage_file_is_malformed() {
        let user = tempdir().unwrap();
        let deps = tempdir().unwrap();
        fs::write(user.path().join("Junk.wunit"), b"not a unit").unwrap();
        let mut loader = loader_for(user.path(), deps.path());
        assert!(matches!(loader.load("Junk"), Err(LoadError::Malformed { .. })));
    }

    #[test]
    fn hook_applies_to_user_units_only() {
        let user = tempdir().unwrap();
        let deps = tempdir().unwrap();
        write_unit(user.path(), &calc_unit());
        let mut lib = calc_unit();
        lib.name = "lib.Util".into();
        write_unit(deps.path(), &lib);

        let mut loader = loader_for(user.path(), deps.path());
        loader.install_hook(instrument::create(InstrumentationKind::BranchCoverage));
        let user_unit = loader.load("demo.Calc").expect("user unit loads");
        let dep_unit = loader.load("lib.Util").expect("dependency unit loads");
        assert!(user_unit.layout().is_some(), "user unit must be instrumented");
        assert!(dep_unit.layout().is_none(), "dependency unit must load unmodified");
        assert_eq!(dep_unit.class(), &lib);
    }

    #[test]
    fn coverage_allocation_is_not_bounded_by_the_array_limit() {
        let user = tempdir().unwrap();
        let deps = tempdir().unwrap();
        let mut unit = calc_unit();
        unit.methods.push(method(
            "alloc",
            vec![],
            ValueType::Int,
            vec![Insn::PushInt(5), Insn::NewBoolArray, Insn::ArrayLen, Insn::Return],
        ));
        write_unit(user.path(), &unit);

        let mut loader = UnitLoader::new(ExecutionLimits {
            max_array_len: 4,
            ..ExecutionLimits::default()
        });
        loader.add_paths([user.path().to_path_buf()], [deps.path().to_path_buf()]);
        loader.install_hook(instrument::create(InstrumentationKind::InstructionCoverage));
        let loaded = loader.load("demo.Calc").expect("instrumented unit loads");
        let layout = loaded.layout().expect("instrumented");
        assert!(layout.descriptor.probe_count > 4);

        let (index, _) = loaded.class().find_method("alloc()I").unwrap();
        match Machine::new(&mut loader).run(&loaded, index, vec![]) {
            Completion::Faulted(fault) => assert_eq!(fault.kind, OUT_OF_MEMORY),
            other => panic!("target allocations stay bounded, got {other:?}"),
        }
    }

    #[test]
    fn units_are_cached_and_initialized_once() {
        let user = tempdir().unwrap();
        let deps = tempdir().unwrap();
        write_unit(
            user.path(),
            &with_initializer(
                "demo.Init",
                vec![
                    Insn::PushBool(true),
                    Insn::PutStatic("ready".into()),
                    Insn::Return,
                ],
            ),
        );
        let mut loader = loader_for(user.path(), deps.path());
        let first = loader.load("demo.Init").unwrap();
        assert_eq!(first.read_static("ready").unwrap().to_value(), Value::Bool(true));
        let second = loader.load("demo.Init").unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(loader.loaded_count(), 1);
    }

    #[test]
    fn failing_initializer_leaves_unit_unloaded() {
        let user = tempdir().unwrap();
        let deps = tempdir().unwrap();
        write_unit(
            user.path(),
            &with_initializer(
                "demo.Broken",
                vec![Insn::PushStr("bad".into()), Insn::Throw("InitError".into())],
            ),
        );
        let mut loader = loader_for(user.path(), deps.path());
        match loader.load("demo.Broken") {
            Err(LoadError::Initializer { fault, .. }) => assert_eq!(fault.kind, "InitError"),
            other => panic!("expected initializer failure, got {other:?}"),
        }
        assert!(loader.loaded("demo.Broken").is_none());
    }

    #[test]
    fn discover_lists_nested_units() {
        let user = tempdir().unwrap();
        let deps = tempdir().unwrap();
        write_unit(user.path(), &calc_unit());
        let mut nested = calc_unit();
        nested.name = "demo.inner.Deep".into();
        write_unit(user.path(), &nested);
        fs::write(user.path().join("notes.txt"), b"ignored").unwrap();
        let loader = loader_for(user.path(), deps.path());
        assert_eq!(
            loader.discover(),
            vec!["demo.Calc".to_string(), "demo.inner.Deep".to_string()]
        );
    }

    #[test]
    fn add_paths_deduplicates() {
        let mut loader = UnitLoader::new(ExecutionLimits::default());
        loader.add_paths([PathBuf::from("a"), PathBuf::from("a")], [PathBuf::from("b")]);
        loader.add_paths([PathBuf::from("a")], [PathBuf::from("b"), PathBuf::from("c")]);
        assert_eq!(loader.user_paths(), &[PathBuf::from("a")]);
        assert_eq!(loader.dependency_paths(), &[PathBuf::from("b"), PathBuf::from("c")]);
    }
}
