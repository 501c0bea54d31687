//! Target selector strings for the JIT's method filters (`JitDisasm`, `JitDump`, ...).
//!
//! Grammar: `<TypePrefix>:<MemberSelector>`, e.g. `MyApp.Program:Main`,
//! `*Inner:.ctor`, ``MyApp.Box`1*:get_Value MyApp.Box`1*:set_Value``.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodKind {
    Ordinary,
    Constructor,
    LocalFunction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolMember {
    /// Every method of the type.
    Type,
    Method {
        name: String,
        kind: MethodKind,
        is_generic: bool,
    },
    Property {
        name: String,
    },
}

/// A resolved code symbol, as handed over by whatever resolved the user's selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSymbolDescriptor {
    pub namespace: Vec<String>,
    /// Enclosing types, outermost first. Empty for top-level types.
    pub containing_types: Vec<String>,
    /// Metadata name of the type itself, including any generic arity suffix (``Box`1``).
    pub type_name: String,
    pub is_generic_type: bool,
    pub member: SymbolMember,
}

/// What the loader app and the JIT need to find the symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolTarget {
    /// Method filter passed to the JIT.
    pub target: String,
    /// Type name the loader app looks up.
    pub class_name: String,
    /// Method name the loader app compiles, `*` for all of them.
    pub method_name: String,
}

impl CodeSymbolDescriptor {
    /// Parse a qualified type name where `+` separates nested types
    /// (`MyApp.Outer+Inner`) and a backtick marks a generic type (``MyApp.Box`1``).
    pub fn from_qualified_type(qualified: &str, member: SymbolMember) -> Option<Self> {
        let mut segments = qualified.trim().split('+');
        let top = segments.next().filter(|s| !s.is_empty())?;
        let mut nested: Vec<String> = segments.map(str::to_string).collect();
        if nested.iter().any(String::is_empty) {
            return None;
        }

        let (namespace, top_name) = match top.rsplit_once('.') {
            Some((ns, name)) => (ns.split('.').map(str::to_string).collect(), name),
            None => (Vec::new(), top),
        };
        if top_name.is_empty() {
            return None;
        }

        let (type_name, containing_types) = match nested.pop() {
            Some(inner) => {
                let mut outer = vec![top_name.to_string()];
                outer.extend(nested);
                (inner, outer)
            }
            None => (top_name.to_string(), Vec::new()),
        };

        Some(Self {
            namespace,
            containing_types,
            is_generic_type: type_name.contains('`'),
            type_name,
            member,
        })
    }

    pub fn is_generic_method(&self) -> bool {
        matches!(self.member, SymbolMember::Method { is_generic: true, .. })
    }

    fn type_prefix(&self) -> String {
        // Nested types are matched by wildcard rather than by their outer path.
        let mut prefix = if self.containing_types.is_empty() {
            self.namespace.iter().map(|ns| format!("{ns}.")).collect()
        } else {
            "*".to_string()
        };
        prefix.push_str(&self.type_name);
        if self.is_generic_type {
            prefix.push('*');
        }
        prefix
    }

    /// Display name of the type: namespace, enclosing types and the type, dot separated.
    pub fn class_name(&self) -> String {
        self.namespace
            .iter()
            .chain(&self.containing_types)
            .chain(std::iter::once(&self.type_name))
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn target(&self) -> SymbolTarget {
        let prefix = self.type_prefix();
        let (target, method_name) = match &self.member {
            SymbolMember::Type => (format!("{prefix}:*"), "*".to_string()),
            SymbolMember::Method { name, kind, .. } => match kind {
                MethodKind::Ordinary => (format!("{prefix}:{name}"), name.clone()),
                MethodKind::Constructor => (format!("{prefix}:.ctor"), "*".to_string()),
                // Local functions get compiler-mangled names like `<Main>g__Local|0_0`.
                MethodKind::LocalFunction => (format!("{prefix}:*{name}*"), "*".to_string()),
            },
            SymbolMember::Property { name } => (
                format!("{prefix}:get_{name} {prefix}:set_{name}"),
                name.clone(),
            ),
        };
        SymbolTarget {
            target,
            class_name: self.class_name(),
            method_name,
        }
    }
}

impl SymbolTarget {
    /// Whether the selection covers a whole type rather than one method.
    pub fn is_whole_type(&self) -> bool {
        self.method_name == "*"
    }
}
