//! User-selected toolchain options.
//!
//! Read from `<config dir>/jitdasm/config.json` (or an explicit path) and then overridden
//! by command-line flags. Every field is optional in the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name of the stock JIT on this platform; selecting it as the custom JIT means "no AltJit".
pub const DEFAULT_JIT: &str = if cfg!(windows) {
    "clrjit.dll"
} else if cfg!(target_os = "macos") {
    "libclrjit.dylib"
} else {
    "libclrjit.so"
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Compiler {
    #[default]
    Jit,
    Crossgen2,
    #[value(name = "nativeaot")]
    #[serde(rename = "nativeaot")]
    NativeAot,
}

impl Compiler {
    pub fn is_ahead_of_time(self) -> bool {
        matches!(self, Compiler::Crossgen2 | Compiler::NativeAot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Target architecture, e.g. `x64` or `arm64`.
    pub arch: String,
    pub compiler: Compiler,

    /// Use a locally built dotnet/runtime (checked JIT) instead of the installed one.
    pub use_custom_runtime: bool,
    pub path_to_local_runtime: Option<PathBuf>,
    /// JIT library to load as AltJit from the local runtime build.
    pub custom_jit: Option<String>,

    pub jit_dump: bool,
    pub print_inlinees: bool,
    pub use_pgo: bool,
    pub diffable: bool,
    pub use_tiered_jit: bool,
    pub show_asm_comments: bool,

    /// Run the user's app instead of the loader app.
    pub run_app_mode: bool,
    /// `JitDisasm` filter to use in run-app mode instead of the selected symbol.
    pub overridden_jit_disasm: Option<String>,

    /// Reload through a self-contained `dotnet publish` instead of `dotnet build`.
    pub use_publish_for_reload: bool,
    pub use_unloadable_context: bool,
    pub use_no_restore: bool,

    pub flowgraph_enable: bool,
    pub graphviz_dot_path: Option<PathBuf>,

    pub crossgen2_args: String,
    pub ilc_args: String,

    pub overridden_target_framework: Option<String>,
    pub dont_guess_target_framework: bool,

    /// Extra environment variables, one `KEY=VALUE` per line. These win over computed ones.
    pub custom_env_vars: String,

    /// Folder created under the project's output path.
    pub output_folder_name: String,

    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            arch: default_arch().to_string(),
            compiler: Compiler::Jit,
            use_custom_runtime: false,
            path_to_local_runtime: None,
            custom_jit: None,
            jit_dump: false,
            print_inlinees: false,
            use_pgo: false,
            diffable: false,
            use_tiered_jit: false,
            show_asm_comments: false,
            run_app_mode: false,
            overridden_jit_disasm: None,
            use_publish_for_reload: false,
            use_unloadable_context: false,
            use_no_restore: false,
            flowgraph_enable: false,
            graphviz_dot_path: None,
            crossgen2_args: String::new(),
            ilc_args: String::new(),
            overridden_target_framework: None,
            dont_guess_target_framework: false,
            custom_env_vars: String::new(),
            output_folder_name: format!("jitdasm-v{}", env!("CARGO_PKG_VERSION")),
            timeout: None,
        }
    }
}

impl Configuration {
    /// Custom JIT name when it names something other than the stock JIT.
    pub fn alt_jit(&self) -> Option<&str> {
        self.custom_jit
            .as_deref()
            .map(str::trim)
            .filter(|jit| !jit.is_empty() && !jit.eq_ignore_ascii_case(DEFAULT_JIT))
    }

    pub fn pinned_target_framework(&self) -> Option<&str> {
        self.overridden_target_framework
            .as_deref()
            .map(str::trim)
            .filter(|tfm| !tfm.is_empty())
    }

    /// Apply [`Configuration::custom_env_vars`] on top of `vars`.
    pub fn fill_with_user_vars(&self, vars: &mut BTreeMap<String, String>) {
        vars.extend(parse_env_vars(&self.custom_env_vars));
    }
}

fn default_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86" => "x86",
        "arm" => "arm",
        _ => "x64",
    }
}

/// Parse `KEY=VALUE` lines. Blank lines, `#` comments and lines without `=` are ignored.
pub fn parse_env_vars(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("jitdasm").join("config.json"))
}

/// Load a configuration file. A missing file at the default location is not an error.
pub fn load_configuration(explicit: Option<&Path>) -> Result<Configuration, SettingsError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(Configuration::default()),
        },
    };

    let text = std::fs::read_to_string(&path).map_err(|source| SettingsError::Read {
        path: path.clone(),
        source,
    })?;
    let config = serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
        path: path.clone(),
        source,
    })?;
    tracing::debug!("loaded configuration from {}", path.display());
    Ok(config)
}
