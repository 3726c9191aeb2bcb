//! The dependency key model.
//!
//! A [`DependencyKey`] names one externally visible facet of a declaration or
//! file: an aspect (interface or implementation) paired with a designator
//! saying *what* is provided or depended upon. Keys carry [`StringId`] handles
//! rather than strings; resolve them through the owning graph's
//! [`StringTable`](crate::interner::StringTable) for display.

use crate::{
    error::{IncrementalError, Result},
    interner::{StringId, StringTable},
    utils,
};
use std::{fmt, path::Path};

/// Coarse classification of a dependency node.
///
/// Interface changes force all uses to rebuild; implementation changes do not
/// propagate beyond the file itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeclAspect {
    Interface,
    Implementation,
}

impl DeclAspect {
    pub fn code(self) -> u64 {
        match self {
            DeclAspect::Interface => 0,
            DeclAspect::Implementation => 1,
        }
    }

    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            0 => Ok(DeclAspect::Interface),
            1 => Ok(DeclAspect::Implementation),
            other => Err(IncrementalError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for DeclAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclAspect::Interface => f.write_str("interface"),
            DeclAspect::Implementation => f.write_str("implementation"),
        }
    }
}

/// A hash the frontend computed over the externally visible tokens of a
/// declaration or file. Equal fingerprints imply no interface-level change.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(Box<str>);

impl Fingerprint {
    pub fn new(value: impl Into<Box<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of on-disk artifact a [`DependencySource`] names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencySourceKind {
    /// A per-input `.swiftdeps` artifact.
    SwiftDeps,
    /// A binary `.swiftmodule` summary with an embedded incremental section.
    SwiftModule,
}

/// A typed path identifying the dependency artifact a subgraph was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencySource {
    path: StringId,
    kind: DependencySourceKind,
}

impl DependencySource {
    /// Interns `path` and classifies it by extension.
    pub fn new(path: &Path, strings: &mut StringTable) -> Result<Self> {
        let kind = match utils::file_extension(path) {
            Some(utils::SWIFTDEPS_EXTENSION) => DependencySourceKind::SwiftDeps,
            Some(utils::SWIFTMODULE_EXTENSION) => DependencySourceKind::SwiftModule,
            other => {
                return Err(IncrementalError::UnknownDependencySourceExtension(
                    other.unwrap_or_default().to_string(),
                ))
            }
        };
        let path = strings.intern(&path.to_string_lossy());
        Ok(Self { path, kind })
    }

    /// Rebuilds a source from an already interned path string.
    pub(crate) fn from_interned(path: StringId, strings: &StringTable) -> Result<Self> {
        let resolved = strings.resolve(path);
        let kind = if utils::is_module_summary_path(resolved) {
            DependencySourceKind::SwiftModule
        } else if Path::new(resolved).extension().and_then(|e| e.to_str())
            == Some(utils::SWIFTDEPS_EXTENSION)
        {
            DependencySourceKind::SwiftDeps
        } else {
            return Err(IncrementalError::UnknownDependencySourceExtension(
                resolved.rsplit('.').next().unwrap_or_default().to_string(),
            ));
        };
        Ok(Self { path, kind })
    }

    pub fn path_id(&self) -> StringId {
        self.path
    }

    pub fn kind(&self) -> DependencySourceKind {
        self.kind
    }

    pub fn path_str<'t>(&self, strings: &'t StringTable) -> &'t str {
        strings.resolve(self.path)
    }
}

/// An artifact outside this module that a file depends on: a header or an
/// imported module. The module-summary classification is cached because it is
/// consulted on every integration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExternalDependency {
    path: StringId,
    is_module_summary: bool,
}

impl ExternalDependency {
    pub fn new(path: &str, strings: &mut StringTable) -> Self {
        Self { path: strings.intern(path), is_module_summary: utils::is_module_summary_path(path) }
    }

    pub(crate) fn from_interned(path: StringId, strings: &StringTable) -> Self {
        Self { path, is_module_summary: utils::is_module_summary_path(strings.resolve(path)) }
    }

    pub fn path_id(&self) -> StringId {
        self.path
    }

    pub fn is_module_summary(&self) -> bool {
        self.is_module_summary
    }

    pub fn path_str<'t>(&self, strings: &'t StringTable) -> &'t str {
        strings.resolve(self.path)
    }
}

/// An external dependency plus the fingerprint the depending file last saw
/// for it, if the frontend recorded one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FingerprintedExternalDependency {
    pub external: ExternalDependency,
    pub fingerprint: Option<Fingerprint>,
}

impl FingerprintedExternalDependency {
    pub fn new(external: ExternalDependency, fingerprint: Option<Fingerprint>) -> Self {
        Self { external, fingerprint }
    }

    /// A fingerprint is only meaningful for module summaries; bridging
    /// headers have no incremental section to compare against.
    pub fn validate(&self, strings: &StringTable) -> Result<()> {
        if self.fingerprint.is_some() && !self.external.is_module_summary() {
            return Err(IncrementalError::ExternalDepWithFingerprintMustPointToModuleSummary(
                self.external.path_str(strings).to_string(),
            ));
        }
        Ok(())
    }
}

/// What a [`DependencyKey`] designates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Designator {
    /// A top-level name.
    TopLevel { name: StringId },
    /// A dynamically dispatched member, e.g. via `AnyObject` lookup.
    DynamicLookup { name: StringId },
    /// A nominal type, identified by its mangled context string.
    Nominal { context: StringId },
    /// The abstract interface of a type or protocol; changes to any member
    /// invalidate it.
    PotentialMember { context: StringId },
    /// A named member of a type.
    Member { context: StringId, name: StringId },
    /// The synthetic node standing for a whole source file.
    SourceFileProvide { name: StringId },
    /// An artifact outside this module.
    ExternalDepend(ExternalDependency),
}

impl Designator {
    pub fn kind_code(&self) -> u64 {
        match self {
            Designator::TopLevel { .. } => 0,
            Designator::Nominal { .. } => 1,
            Designator::PotentialMember { .. } => 2,
            Designator::Member { .. } => 3,
            Designator::DynamicLookup { .. } => 4,
            Designator::ExternalDepend(_) => 5,
            Designator::SourceFileProvide { .. } => 6,
        }
    }

    /// Reassembles a designator from its serialized parts, enforcing the
    /// per-kind emptiness constraints on context and name.
    pub fn from_parts(
        kind_code: u64,
        context: StringId,
        name: StringId,
        strings: &StringTable,
    ) -> Result<Self> {
        // `expect(context_empty, name_empty)` enforces the per-kind shape
        let expect = |context_empty: bool, name_empty: bool| {
            if context.is_empty() != context_empty || name.is_empty() != name_empty {
                Err(IncrementalError::BogusNameOrContext)
            } else {
                Ok(())
            }
        };
        match kind_code {
            0 => {
                expect(true, false)?;
                Ok(Designator::TopLevel { name })
            }
            1 => {
                expect(false, true)?;
                Ok(Designator::Nominal { context })
            }
            2 => {
                expect(false, true)?;
                Ok(Designator::PotentialMember { context })
            }
            3 => {
                expect(false, false)?;
                Ok(Designator::Member { context, name })
            }
            4 => {
                expect(true, false)?;
                Ok(Designator::DynamicLookup { name })
            }
            5 => {
                expect(true, false)?;
                Ok(Designator::ExternalDepend(ExternalDependency::from_interned(name, strings)))
            }
            6 => {
                expect(true, false)?;
                Ok(Designator::SourceFileProvide { name })
            }
            other => Err(IncrementalError::UnknownKind(other)),
        }
    }

    /// The mangled context string, or [`StringId::EMPTY`] for kinds that have
    /// none.
    pub fn context(&self) -> StringId {
        match self {
            Designator::Nominal { context }
            | Designator::PotentialMember { context }
            | Designator::Member { context, .. } => *context,
            _ => StringId::EMPTY,
        }
    }

    /// The name string, or [`StringId::EMPTY`] for kinds that have none.
    pub fn name(&self) -> StringId {
        match self {
            Designator::TopLevel { name }
            | Designator::DynamicLookup { name }
            | Designator::Member { name, .. }
            | Designator::SourceFileProvide { name } => *name,
            Designator::ExternalDepend(external) => external.path_id(),
            Designator::Nominal { .. } | Designator::PotentialMember { .. } => StringId::EMPTY,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Designator::TopLevel { .. } => "top-level",
            Designator::DynamicLookup { .. } => "dynamic-lookup",
            Designator::Nominal { .. } => "nominal",
            Designator::PotentialMember { .. } => "potential-member",
            Designator::Member { .. } => "member",
            Designator::SourceFileProvide { .. } => "source-file",
            Designator::ExternalDepend(_) => "external",
        }
    }
}

/// (aspect, designator): one trackable facet of a declaration or file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DependencyKey {
    pub aspect: DeclAspect,
    pub designator: Designator,
}

impl DependencyKey {
    pub fn new(aspect: DeclAspect, designator: Designator) -> Self {
        Self { aspect, designator }
    }

    /// The synthetic whole-file key for a source file.
    pub fn source_file_provide(aspect: DeclAspect, name: StringId) -> Self {
        Self { aspect, designator: Designator::SourceFileProvide { name } }
    }

    /// The interface-aspect key for an external dependency.
    pub fn external(external: ExternalDependency) -> Self {
        Self { aspect: DeclAspect::Interface, designator: Designator::ExternalDepend(external) }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.designator, Designator::ExternalDepend(_))
    }

    /// External-dependency nodes are always interface aspect.
    pub fn verify(&self) -> Result<()> {
        if self.is_external() && self.aspect != DeclAspect::Interface {
            return Err(IncrementalError::ExternalDepsMustBeInterface);
        }
        Ok(())
    }

    /// A human-readable rendition for remarks and tracing.
    pub fn display<'t>(&self, strings: &'t StringTable) -> DependencyKeyDisplay<'_, 't> {
        DependencyKeyDisplay { key: self, strings }
    }
}

pub struct DependencyKeyDisplay<'k, 't> {
    key: &'k DependencyKey,
    strings: &'t StringTable,
}

impl fmt::Display for DependencyKeyDisplay<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let designator = &self.key.designator;
        write!(f, "{} {}", self.key.aspect, designator.kind_name())?;
        let context = designator.context();
        if !context.is_empty() {
            write!(f, " {}", self.strings.resolve(context))?;
        }
        let name = designator.name();
        if !name.is_empty() {
            write!(f, " '{}'", self.strings.resolve(name))?;
        }
        Ok(())
    }
}
