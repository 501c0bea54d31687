//! Early checks that turn bad combinations of options into a readable message instead of
//! an obscure tool failure.

use crate::error::RunError;
use crate::project::{LocalRuntime, TfmVersion};
use crate::settings::{Compiler, Configuration};
use crate::symbol::{CodeSymbolDescriptor, SymbolTarget};
use std::path::PathBuf;

/// Resolved pieces of a local dotnet/runtime build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifacts {
    pub repo: PathBuf,
    pub checked_dir: PathBuf,
    pub runtime_pack: Option<PathBuf>,
    pub native_aot_dir: Option<PathBuf>,
}

/// What survives validation.
#[derive(Debug, Clone)]
pub struct Validated {
    pub target: SymbolTarget,
    pub local: Option<LocalArtifacts>,
}

fn build_script() -> &'static str {
    if cfg!(windows) {
        "build.cmd"
    } else {
        "./build.sh"
    }
}

/// Run every gate in order; the first failing one wins.
pub fn validate(
    symbol: Option<&CodeSymbolDescriptor>,
    config: &Configuration,
) -> Result<Validated, RunError> {
    let symbol = symbol.ok_or_else(|| {
        RunError::validation(
            "Symbol is not recognized, select a method or a class (see --type and --method)",
        )
    })?;

    let local = if config.use_custom_runtime {
        Some(local_artifacts(config)?)
    } else {
        None
    };

    if symbol.is_generic_method() && !config.run_app_mode {
        return Err(RunError::validation(
            "Generic methods are only supported in 'Run' mode",
        ));
    }

    if config.run_app_mode && config.use_publish_for_reload {
        return Err(RunError::validation(
            "\"Run current app\" mode only works with the \"dotnet build\" reload strategy (disable use_publish_for_reload).",
        ));
    }

    if config.flowgraph_enable {
        let dot_found = config
            .graphviz_dot_path
            .as_deref()
            .is_some_and(|path| path.is_file());
        if !dot_found {
            return Err(RunError::validation(
                "Graphviz is not installed or the path to dot is incorrect (graphviz_dot_path).\n\
                 Graphviz can be installed from https://graphviz.org/download/",
            ));
        }
        if !config.jit_dump {
            return Err(RunError::validation(
                "Either disable flowgraphs or enable JitDump.",
            ));
        }
    }

    if config.compiler.is_ahead_of_time() {
        check_ahead_of_time(config)?;
    }

    let target = symbol.target();
    if config.flowgraph_enable && target.is_whole_type() {
        return Err(RunError::validation(
            "Flowgraph for classes (all methods) is not supported yet.",
        ));
    }

    Ok(Validated { target, local })
}

fn check_ahead_of_time(config: &Configuration) -> Result<(), RunError> {
    if config.use_pgo {
        return Err(RunError::validation("PGO has no effect on R2R'd/NativeAOT code."));
    }
    if config.run_app_mode {
        return Err(RunError::validation(
            "Run mode is not supported for crossgen/NativeAOT",
        ));
    }
    if config.use_tiered_jit {
        return Err(RunError::validation(
            "TieredJIT has no effect on R2R'd/NativeAOT code.",
        ));
    }
    if config.flowgraph_enable {
        return Err(RunError::validation(
            "Flowgraphs are not tested with crossgen2/NativeAOT yet",
        ));
    }
    if config.compiler == Compiler::Crossgen2 && !config.use_custom_runtime {
        return Err(RunError::validation(
            "crossgen2 mode needs a locally built dotnet/runtime: enable use_custom_runtime and set path_to_local_runtime.",
        ));
    }
    Ok(())
}

/// Locate the checked CoreCLR build (and, where needed, the runtime pack and the NativeAOT
/// compiler) in the user's dotnet/runtime clone.
pub fn local_artifacts(config: &Configuration) -> Result<LocalArtifacts, RunError> {
    let arch = &config.arch;
    let not_built = || {
        let crossgen_hint = if config.compiler == Compiler::Crossgen2 {
            "\n(When you use crossgen and target e.g. arm64 you need coreclr built for that arch)"
        } else {
            ""
        };
        RunError::validation(format!(
            "Path to a local dotnet/runtime repository is either not set or it's not built for {arch} arch yet{crossgen_hint}\n\
             Please clone it and build it in `Checked` mode, e.g.:\n\n\
             git clone git@github.com:dotnet/runtime.git\n\
             cd runtime\n\
             {} Clr+Clr.Aot+Libs -c Release -rc Checked -a {arch}\n",
            build_script()
        ))
    };

    let runtime = match config.path_to_local_runtime.as_deref() {
        Some(repo) => LocalRuntime::new(repo, arch.as_str()),
        None => return Err(not_built()),
    };
    let checked_dir = runtime.checked_dir().ok_or_else(not_built)?;

    let runtime_pack = runtime.runtime_pack();
    if runtime_pack.is_none() && !config.use_publish_for_reload {
        return Err(RunError::validation(format!(
            "Please, build a runtime-pack in your local repo:\n\n\
             Run '{} Clr+Clr.Aot+Libs -c Release -a {arch}' in the repo root\n\
             Don't worry, you won't have to re-build it every time you change something in jit, vm or corelib.",
            build_script()
        )));
    }

    let native_aot_dir = runtime.native_aot_dir();
    if config.compiler == Compiler::NativeAot && native_aot_dir.is_none() {
        return Err(RunError::validation(format!(
            "Path to a local dotnet/runtime repository is either not set or it's not correctly built for {arch} arch yet for NativeAOT\n\
             Please clone it and build it using the following steps:\n\n\
             git clone git@github.com:dotnet/runtime.git\n\
             cd runtime\n\
             {} Clr+Clr.Aot+Libs -c Release -rc Checked -a {arch}\n",
            build_script()
        )));
    }

    Ok(LocalArtifacts {
        repo: runtime.repo,
        checked_dir,
        runtime_pack,
        native_aot_dir,
    })
}

/// Frameworks older than net6.0 are rejected; net6.0 only works with a local runtime.
pub fn check_target_framework(tfm: &str, config: &Configuration) -> Result<(), RunError> {
    match TfmVersion::parse(tfm).map(|v| v.major) {
        Some(major) if major >= 7 => Ok(()),
        Some(6) if config.use_custom_runtime => Ok(()),
        Some(6) => Err(RunError::validation(
            "Only net7.0 (and newer) apps are supported with non-locally built dotnet/runtime.\n\
             Make sure <TargetFramework>net7.0</TargetFramework> is set in your csproj.",
        )),
        _ => Err(RunError::validation(
            "Only net6.0 (and newer) apps are supported.\n\
             Make sure <TargetFramework>net6.0</TargetFramework> is set in your csproj.",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::artifacts_os;
    use crate::symbol::{MethodKind, SymbolMember};

    fn method(generic: bool) -> CodeSymbolDescriptor {
        CodeSymbolDescriptor::from_qualified_type(
            "MyApp.Program",
            SymbolMember::Method {
                name: "Foo".into(),
                kind: MethodKind::Ordinary,
                is_generic: generic,
            },
        )
        .unwrap()
    }

    fn message(result: Result<Validated, RunError>) -> String {
        match result {
            Err(RunError::Validation(message)) => message,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    fn fake_dot() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[test]
    fn missing_symbol_is_rejected_first() {
        let config = Configuration {
            use_custom_runtime: true,
            ..Default::default()
        };
        assert!(message(validate(None, &config)).starts_with("Symbol is not recognized"));
    }

    #[test]
    fn plain_method_passes() {
        let validated = validate(Some(&method(false)), &Configuration::default()).unwrap();
        assert_eq!(validated.target.target, "MyApp.Program:Foo");
        assert!(validated.local.is_none());
    }

    #[test]
    fn custom_runtime_needs_a_checked_build() {
        let config = Configuration {
            use_custom_runtime: true,
            path_to_local_runtime: Some(PathBuf::from("/no/such/runtime")),
            ..Default::default()
        };
        let text = message(validate(Some(&method(false)), &config));
        assert!(text.contains("arch yet"));
        assert!(text.contains("-rc Checked"));
    }

    #[test]
    fn custom_runtime_needs_a_runtime_pack_unless_publishing() {
        let repo = tempfile::tempdir().unwrap();
        let mut config = Configuration {
            arch: "x64".into(),
            use_custom_runtime: true,
            path_to_local_runtime: Some(repo.path().to_path_buf()),
            ..Default::default()
        };
        std::fs::create_dir_all(
            repo.path()
                .join(format!("artifacts/bin/coreclr/{}.x64.Checked", artifacts_os())),
        )
        .unwrap();

        let text = message(validate(Some(&method(false)), &config));
        assert!(text.starts_with("Please, build a runtime-pack"));

        config.use_publish_for_reload = true;
        let validated = validate(Some(&method(false)), &config).unwrap();
        let local = validated.local.unwrap();
        assert_eq!(local.runtime_pack, None);
        assert_eq!(local.repo, repo.path());
    }

    #[test]
    fn generic_methods_need_run_mode() {
        let mut config = Configuration::default();
        assert_eq!(
            message(validate(Some(&method(true)), &config)),
            "Generic methods are only supported in 'Run' mode"
        );
        config.run_app_mode = true;
        assert!(validate(Some(&method(true)), &config).is_ok());
    }

    #[test]
    fn run_mode_rejects_publish() {
        let config = Configuration {
            run_app_mode: true,
            use_publish_for_reload: true,
            ..Default::default()
        };
        assert!(message(validate(Some(&method(false)), &config)).contains("\"dotnet build\" reload strategy"));
    }

    #[test]
    fn flowgraph_gates() {
        let dot = fake_dot();
        let mut config = Configuration {
            flowgraph_enable: true,
            graphviz_dot_path: Some(PathBuf::from("/no/such/dot")),
            ..Default::default()
        };
        assert!(message(validate(Some(&method(false)), &config)).starts_with("Graphviz is not installed"));

        config.graphviz_dot_path = Some(dot.path().to_path_buf());
        assert_eq!(
            message(validate(Some(&method(false)), &config)),
            "Either disable flowgraphs or enable JitDump."
        );

        config.jit_dump = true;
        assert!(validate(Some(&method(false)), &config).is_ok());

        let whole_type =
            CodeSymbolDescriptor::from_qualified_type("MyApp.Program", SymbolMember::Type).unwrap();
        assert_eq!(
            message(validate(Some(&whole_type), &config)),
            "Flowgraph for classes (all methods) is not supported yet."
        );
    }

    #[test]
    fn ahead_of_time_gates() {
        let base = Configuration {
            compiler: Compiler::NativeAot,
            ..Default::default()
        };
        let cases = [
            (Configuration { use_pgo: true, ..base.clone() }, "PGO has no effect"),
            (Configuration { run_app_mode: true, ..base.clone() }, "Run mode is not supported"),
            (Configuration { use_tiered_jit: true, ..base.clone() }, "TieredJIT has no effect"),
        ];
        for (config, expected) in cases {
            assert!(message(validate(Some(&method(false)), &config)).starts_with(expected));
        }
        assert!(validate(Some(&method(false)), &base).is_ok());

        let crossgen = Configuration {
            compiler: Compiler::Crossgen2,
            ..Default::default()
        };
        assert!(message(validate(Some(&method(false)), &crossgen)).starts_with("crossgen2 mode needs"));
    }

    #[test]
    fn target_framework_floor() {
        let installed = Configuration::default();
        let custom = Configuration {
            use_custom_runtime: true,
            ..Default::default()
        };
        assert!(check_target_framework("net8.0", &installed).is_ok());
        assert!(check_target_framework("net7.0", &installed).is_ok());
        assert!(check_target_framework("net6.0", &custom).is_ok());

        let err = check_target_framework("net6.0", &installed).unwrap_err();
        assert!(err.to_string().starts_with("Only net7.0 (and newer)"));
        let err = check_target_framework("netcoreapp3.1", &custom).unwrap_err();
        assert!(err.to_string().starts_with("Only net6.0 (and newer)"));
        assert!(check_target_framework("netstandard2.0", &custom).is_err());
    }
}
