//! Project context: what to build, for which framework, and where the output lands.
//!
//! Also locates artifacts of a locally built dotnet/runtime repository (checked CoreCLR,
//! runtime packs) for the custom-runtime strategies.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const RELEASE: &str = "Release";

/// `net8.0` -> 8.0, `netcoreapp3.1` -> 3.1, `net8.0-windows` -> 8.0, `net48` -> 4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TfmVersion {
    pub major: u32,
    pub minor: u32,
}

impl TfmVersion {
    pub fn parse(tfm: &str) -> Option<Self> {
        let tfm = tfm.trim().to_ascii_lowercase();
        let version = tfm
            .strip_prefix("netcoreapp")
            .or_else(|| tfm.strip_prefix("net"))
            .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))?;
        let version = version.split('-').next().unwrap_or(version);

        match version.split_once('.') {
            Some((major, minor)) => Some(Self {
                major: major.parse().ok()?,
                minor: minor.parse().ok()?,
            }),
            // .NET Framework monikers: net48, net472
            None if version.len() >= 2 => Some(Self {
                major: version[..1].parse().ok()?,
                minor: version[1..2].parse().ok()?,
            }),
            None => Some(Self {
                major: version.parse().ok()?,
                minor: 0,
            }),
        }
    }
}

impl fmt::Display for TfmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// One (configuration, target framework) pair the project can be built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectConfiguration {
    pub configuration: String,
    pub target_framework: Option<String>,
}

impl ProjectConfiguration {
    pub fn tfm_version(&self) -> Option<TfmVersion> {
        self.target_framework.as_deref().and_then(TfmVersion::parse)
    }

    pub fn is_release(&self) -> bool {
        self.configuration.eq_ignore_ascii_case(RELEASE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectContext {
    pub project_path: PathBuf,
    pub assembly_name: String,
    /// `OutputPath` as written in the project; relative to the project directory.
    pub output_path: Option<PathBuf>,
    pub configurations: Vec<ProjectConfiguration>,
}

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("failed to read project {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed project {}: {message}", path.display())]
    Xml { path: PathBuf, message: String },
}

impl ProjectContext {
    /// Read an MSBuild project file.
    pub fn load(path: &Path) -> Result<Self, ProjectError> {
        let text = std::fs::read_to_string(path).map_err(|source| ProjectError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_xml(path, &text)
    }

    pub fn from_xml(path: &Path, xml: &str) -> Result<Self, ProjectError> {
        let props = read_properties(xml).map_err(|message| ProjectError::Xml {
            path: path.to_path_buf(),
            message,
        })?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let assembly_name = props
            .get("AssemblyName")
            .cloned()
            .unwrap_or(stem);

        let frameworks: Vec<String> = match props.get("TargetFrameworks") {
            Some(list) => split_list(list),
            None => props.get("TargetFramework").map(|tfm| vec![tfm.clone()]).unwrap_or_default(),
        };
        let configuration_names = props
            .get("Configurations")
            .map(|list| split_list(list))
            .unwrap_or_else(|| vec!["Debug".to_string(), RELEASE.to_string()]);

        let mut configurations = Vec::new();
        for configuration in &configuration_names {
            if frameworks.is_empty() {
                configurations.push(ProjectConfiguration {
                    configuration: configuration.clone(),
                    target_framework: None,
                });
            }
            for tfm in &frameworks {
                configurations.push(ProjectConfiguration {
                    configuration: configuration.clone(),
                    target_framework: Some(tfm.clone()),
                });
            }
        }

        Ok(Self {
            project_path: path.to_path_buf(),
            assembly_name,
            output_path: props.get("OutputPath").map(PathBuf::from),
            configurations,
        })
    }

    pub fn project_dir(&self) -> PathBuf {
        match self.project_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Plain property values from the project file. Values that are MSBuild expressions
/// (`$(...)`) cannot be evaluated here and are skipped.
fn read_properties(xml: &str) -> Result<HashMap<String, String>, String> {
    const WANTED: [&str; 5] = [
        "TargetFramework",
        "TargetFrameworks",
        "AssemblyName",
        "OutputPath",
        "Configurations",
    ];

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut current: Option<String> = None;
    let mut props = HashMap::new();

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                current = WANTED.contains(&name.as_str()).then_some(name);
            }
            Event::Text(text) => {
                if let Some(name) = &current {
                    let value = text.unescape().map_err(|e| e.to_string())?;
                    let value = value.trim();
                    if !value.is_empty() && !value.contains("$(") {
                        props.insert(name.clone(), value.to_string());
                    }
                }
            }
            Event::End(_) => current = None,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(props)
}

/// Pick the configuration to build: `Release` ones when there are any, then the highest
/// target framework, or the highest one not above `pinned` when the user pinned one.
pub fn select_configuration<'a>(
    configurations: &'a [ProjectConfiguration],
    pinned: Option<&str>,
) -> Option<&'a ProjectConfiguration> {
    let mut candidates: Vec<&ProjectConfiguration> = configurations.iter().collect();
    candidates.sort_by(|a, b| compare_versions_desc(a.tfm_version(), b.tfm_version()));
    if candidates.iter().any(|c| c.is_release()) {
        candidates.retain(|c| c.is_release());
    }

    let pinned = pinned.and_then(TfmVersion::parse);
    match pinned {
        Some(pin) => candidates
            .iter()
            .copied()
            .find(|c| c.tfm_version().is_some_and(|v| v <= pin))
            .or_else(|| candidates.first().copied()),
        None => candidates.first().copied(),
    }
}

fn compare_versions_desc(a: Option<TfmVersion>, b: Option<TfmVersion>) -> Ordering {
    b.cmp(&a)
}

/// OS part of runtime identifiers (`win-x64`).
pub fn rid_os() -> &'static str {
    if cfg!(windows) {
        "win"
    } else if cfg!(target_os = "macos") {
        "osx"
    } else {
        "linux"
    }
}

/// OS part of dotnet/runtime artifact folders (`windows.x64.Checked`).
pub fn artifacts_os() -> &'static str {
    if cfg!(windows) {
        "windows"
    } else if cfg!(target_os = "macos") {
        "osx"
    } else {
        "linux"
    }
}

/// A local clone of dotnet/runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRuntime {
    pub repo: PathBuf,
    pub arch: String,
}

impl LocalRuntime {
    pub fn new(repo: impl Into<PathBuf>, arch: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            arch: arch.into(),
        }
    }

    fn coreclr_bin(&self) -> PathBuf {
        self.repo.join("artifacts").join("bin").join("coreclr")
    }

    /// Checked (or, failing that, Debug) CoreCLR build output.
    pub fn checked_dir(&self) -> Option<PathBuf> {
        ["Checked", "Debug"]
            .iter()
            .map(|flavor| {
                self.coreclr_bin()
                    .join(format!("{}.{}.{flavor}", artifacts_os(), self.arch))
            })
            .find(|dir| dir.is_dir())
    }

    /// Checked CoreCLR build that also contains the NativeAOT compiler.
    pub fn native_aot_dir(&self) -> Option<PathBuf> {
        let dir = self
            .coreclr_bin()
            .join(format!("{}.{}.Checked", artifacts_os(), self.arch));
        (dir.join("aotsdk").is_dir() && dir.join("ilc").is_dir()).then_some(dir)
    }

    /// Newest Release runtime pack for this OS and arch.
    pub fn runtime_pack(&self) -> Option<PathBuf> {
        let packs = self.repo.join("artifacts").join("bin").join("runtime");
        let suffix = format!("-{}-Release-{}", artifacts_os(), self.arch);
        let mut found: Vec<PathBuf> = std::fs::read_dir(packs)
            .ok()?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter(|path| {
                path.file_name()
                    .is_some_and(|name| name.to_string_lossy().ends_with(&suffix))
            })
            .collect();
        found.sort();
        found.pop()
    }
}
