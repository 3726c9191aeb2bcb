//! The build record: per-input status persisted between invocations.
//!
//! A YAML mapping with the compiler version, a hash of the options affecting
//! incremental builds, the previous build's start and end times, and one
//! entry per input carrying its modification time and status tag (`!dirty`
//! for cascading, `!private` for non-cascading, untagged for up to date).

use crate::{
    error::{IncrementalError, Result},
    fs::FileSystem,
    utils::TimePoint,
};
use serde_yaml::{value::Tag, value::TaggedValue, Mapping, Value};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

const KEY_VERSION: &str = "version";
const KEY_OPTIONS: &str = "options";
const KEY_BUILD_START_TIME: &str = "build_start_time";
const KEY_BUILD_END_TIME: &str = "build_end_time";
const KEY_INPUTS: &str = "inputs";

const TAG_DIRTY: &str = "dirty";
const TAG_PRIVATE: &str = "private";

/// Status of one input after the previous build, ordered from least to
/// greatest downstream impact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InputStatus {
    /// Compiled successfully; skip unless something changed.
    UpToDate,
    /// Must recompile, but its dependents need not.
    NeedsNonCascadingBuild,
    /// Must recompile along with its transitive dependents.
    NeedsCascadingBuild,
    /// First seen this build; there is no graph data for it yet.
    NewlyAdded,
}

impl InputStatus {
    /// The on-disk tag aliases [`InputStatus::NewlyAdded`] to the cascading
    /// tag, so the two are indistinguishable on read.
    fn tag(self) -> Option<&'static str> {
        match self {
            InputStatus::UpToDate => None,
            InputStatus::NeedsNonCascadingBuild => Some(TAG_PRIVATE),
            InputStatus::NeedsCascadingBuild | InputStatus::NewlyAdded => Some(TAG_DIRTY),
        }
    }
}

/// Status plus the modification time the input had when it was last
/// compiled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InputInfo {
    pub status: InputStatus,
    pub previous_mod_time: TimePoint,
}

impl InputInfo {
    pub fn new(status: InputStatus, previous_mod_time: TimePoint) -> Self {
        Self { status, previous_mod_time }
    }
}

/// Everything remembered about the previous invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildRecord {
    /// Compiler version string of the build that wrote the record.
    pub swift_version: String,
    /// Hex SHA-256 over the options affecting incremental builds. Absent in
    /// records written by older drivers.
    pub args_hash: Option<String>,
    pub build_start_time: TimePoint,
    pub build_end_time: TimePoint,
    pub input_infos: BTreeMap<PathBuf, InputInfo>,
}

impl BuildRecord {
    pub fn new(
        swift_version: impl Into<String>,
        args_hash: Option<String>,
        build_start_time: TimePoint,
        build_end_time: TimePoint,
        input_infos: BTreeMap<PathBuf, InputInfo>,
    ) -> Self {
        Self {
            swift_version: swift_version.into(),
            args_hash,
            build_start_time,
            build_end_time,
            input_infos,
        }
    }

    /// Hashes the descriptions of the options that affect incremental
    /// builds. Input options are the caller's business to exclude.
    pub fn args_hash_of<'a>(args: impl IntoIterator<Item = &'a str>) -> String {
        let mut hasher = Sha256::new();
        for arg in args {
            hasher.update(arg.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Parses the YAML text of a build record. Unknown keys are errors; a
    /// missing options hash is tolerated for records from older drivers.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text)?;
        let Value::Mapping(mapping) = value else {
            return Err(IncrementalError::msg("build record is not a mapping"));
        };

        let mut swift_version = None;
        let mut args_hash = None;
        let mut build_start_time = None;
        let mut build_end_time = None;
        let mut input_infos = BTreeMap::new();

        for (key, value) in mapping {
            let Value::String(key) = key else {
                return Err(IncrementalError::msg("non-string key in build record"));
            };
            match key.as_str() {
                KEY_VERSION => swift_version = Some(expect_string(&value)?),
                KEY_OPTIONS => args_hash = Some(expect_string(&value)?),
                KEY_BUILD_START_TIME => build_start_time = Some(parse_time(&value)?),
                KEY_BUILD_END_TIME => build_end_time = Some(parse_time(&value)?),
                KEY_INPUTS => {
                    let Value::Mapping(inputs) = value else {
                        return Err(IncrementalError::msg("build record inputs is not a mapping"));
                    };
                    for (input, info) in inputs {
                        let Value::String(input) = input else {
                            return Err(IncrementalError::msg(
                                "non-string input path in build record",
                            ));
                        };
                        input_infos.insert(PathBuf::from(input), parse_input_info(&info)?);
                    }
                }
                unknown => {
                    return Err(IncrementalError::msg(format!(
                        "unexpected key {unknown:?} in build record"
                    )))
                }
            }
        }

        Ok(Self {
            swift_version: swift_version
                .ok_or_else(|| IncrementalError::msg("build record is missing its version"))?,
            args_hash,
            build_start_time: build_start_time
                .ok_or_else(|| IncrementalError::msg("build record is missing build_start_time"))?,
            build_end_time: build_end_time
                .ok_or_else(|| IncrementalError::msg("build record is missing build_end_time"))?,
            input_infos,
        })
    }

    /// Renders the record as YAML text.
    pub fn serialize(&self) -> Result<String> {
        let mut mapping = Mapping::new();
        mapping.insert(
            Value::String(KEY_VERSION.into()),
            Value::String(self.swift_version.clone()),
        );
        if let Some(args_hash) = &self.args_hash {
            mapping
                .insert(Value::String(KEY_OPTIONS.into()), Value::String(args_hash.clone()));
        }
        mapping.insert(
            Value::String(KEY_BUILD_START_TIME.into()),
            time_value(self.build_start_time),
        );
        mapping
            .insert(Value::String(KEY_BUILD_END_TIME.into()), time_value(self.build_end_time));

        let mut inputs = Mapping::new();
        for (input, info) in &self.input_infos {
            let time = time_value(info.previous_mod_time);
            let value = match info.status.tag() {
                None => time,
                Some(tag) => Value::Tagged(Box::new(TaggedValue {
                    tag: Tag::new(tag),
                    value: time,
                })),
            };
            inputs.insert(Value::String(input.to_string_lossy().into_owned()), value);
        }
        mapping.insert(Value::String(KEY_INPUTS.into()), Value::Mapping(inputs));

        Ok(serde_yaml::to_string(&Value::Mapping(mapping))?)
    }

    pub fn read(path: &Path, fs: &dyn FileSystem) -> Result<Self> {
        let bytes = fs.read(path).map_err(|e| IncrementalError::read_failure(path, e))?;
        let text = String::from_utf8_lossy(&bytes);
        Self::parse(&text)
    }

    pub fn write(&self, path: &Path, fs: &dyn FileSystem) -> Result<()> {
        let text = self.serialize()?;
        fs.write(path, text.as_bytes())
            .map_err(|e| IncrementalError::write_failure(path, e))?;
        debug!("wrote build record to {}", path.display());
        Ok(())
    }
}

fn expect_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(IncrementalError::msg(format!("expected a string, found {other:?}"))),
    }
}

fn parse_time(value: &Value) -> Result<TimePoint> {
    let Value::Sequence(seq) = value else {
        return Err(IncrementalError::msg("timestamp is not a two-integer sequence"));
    };
    if seq.len() != 2 {
        return Err(IncrementalError::msg("timestamp is not a two-integer sequence"));
    }
    let seconds = seq[0]
        .as_i64()
        .ok_or_else(|| IncrementalError::msg("timestamp seconds is not an integer"))?;
    let nanoseconds = seq[1]
        .as_u64()
        .ok_or_else(|| IncrementalError::msg("timestamp nanoseconds is not an integer"))?;
    Ok(TimePoint::new(seconds, nanoseconds as u32))
}

fn parse_input_info(value: &Value) -> Result<InputInfo> {
    match value {
        Value::Tagged(tagged) => {
            let status = if tagged.tag == TAG_DIRTY {
                // `!dirty` also encodes newly-added inputs; they read back as
                // cascading
                InputStatus::NeedsCascadingBuild
            } else if tagged.tag == TAG_PRIVATE {
                InputStatus::NeedsNonCascadingBuild
            } else {
                return Err(IncrementalError::msg(format!(
                    "unknown input status tag {}",
                    tagged.tag
                )));
            };
            Ok(InputInfo::new(status, parse_time(&tagged.value)?))
        }
        other => Ok(InputInfo::new(InputStatus::UpToDate, parse_time(other)?)),
    }
}

fn time_value(time: TimePoint) -> Value {
    Value::Sequence(vec![
        Value::Number(time.seconds.into()),
        Value::Number(u64::from(time.nanoseconds).into()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_record() -> BuildRecord {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            PathBuf::from("a.swift"),
            InputInfo::new(InputStatus::UpToDate, TimePoint::new(100, 1)),
        );
        inputs.insert(
            PathBuf::from("b.swift"),
            InputInfo::new(InputStatus::NeedsCascadingBuild, TimePoint::new(200, 2)),
        );
        inputs.insert(
            PathBuf::from("c.swift"),
            InputInfo::new(InputStatus::NeedsNonCascadingBuild, TimePoint::new(300, 3)),
        );
        BuildRecord::new(
            "Swift 5.7-dev",
            Some(BuildRecord::args_hash_of(["-module-name", "Foo", "-O"])),
            TimePoint::new(1000, 0),
            TimePoint::new(1010, 500),
            inputs,
        )
    }

    #[test]
    fn roundtrip_without_newly_added() {
        let record = sample_record();
        let text = record.serialize().unwrap();
        let parsed = BuildRecord::parse(&text).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn newly_added_reads_back_as_cascading() {
        let mut record = sample_record();
        record.input_infos.insert(
            PathBuf::from("d.swift"),
            InputInfo::new(InputStatus::NewlyAdded, TimePoint::new(400, 4)),
        );
        let text = record.serialize().unwrap();
        let parsed = BuildRecord::parse(&text).unwrap();
        assert_eq!(
            parsed.input_infos[Path::new("d.swift")].status,
            InputStatus::NeedsCascadingBuild
        );
    }

    #[test]
    fn parses_handwritten_record() {
        let text = r#"
version: "Apple Swift version 5.7"
options: "abc123"
build_start_time: [1000, 0]
build_end_time: [1001, 900]
inputs:
  "/tmp/a.swift": [100, 1]
  "/tmp/b.swift": !dirty [200, 2]
  "/tmp/c.swift": !private [300, 3]
"#;
        let record = BuildRecord::parse(text).unwrap();
        assert_eq!(record.swift_version, "Apple Swift version 5.7");
        assert_eq!(record.args_hash.as_deref(), Some("abc123"));
        assert_eq!(record.build_start_time, TimePoint::new(1000, 0));
        assert_eq!(
            record.input_infos[Path::new("/tmp/a.swift")],
            InputInfo::new(InputStatus::UpToDate, TimePoint::new(100, 1))
        );
        assert_eq!(
            record.input_infos[Path::new("/tmp/b.swift")].status,
            InputStatus::NeedsCascadingBuild
        );
        assert_eq!(
            record.input_infos[Path::new("/tmp/c.swift")].status,
            InputStatus::NeedsNonCascadingBuild
        );
    }

    #[test]
    fn missing_options_is_tolerated() {
        let text = r#"
version: "Apple Swift version 5.5"
build_start_time: [1, 0]
build_end_time: [2, 0]
inputs: {}
"#;
        let record = BuildRecord::parse(text).unwrap();
        assert_eq!(record.args_hash, None);
    }

    #[test]
    fn unknown_keys_are_errors() {
        let text = r#"
version: "x"
build_start_time: [1, 0]
build_end_time: [2, 0]
inputs: {}
qux: 1
"#;
        assert!(BuildRecord::parse(text).is_err());
    }

    #[test]
    fn status_ordering_follows_downstream_impact() {
        assert!(InputStatus::UpToDate < InputStatus::NeedsNonCascadingBuild);
        assert!(InputStatus::NeedsNonCascadingBuild < InputStatus::NeedsCascadingBuild);
        assert!(InputStatus::NeedsCascadingBuild < InputStatus::NewlyAdded);
    }

    #[test]
    fn args_hash_is_stable_and_order_sensitive() {
        let a = BuildRecord::args_hash_of(["-O", "-g"]);
        let b = BuildRecord::args_hash_of(["-O", "-g"]);
        let c = BuildRecord::args_hash_of(["-g", "-O"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
