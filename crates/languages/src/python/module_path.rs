//! Module path derivation for Python files
//!
//! Derives the dotted Python module path from a repository-relative file path.

/// Module path of a Python file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePath {
    /// Dotted module name, e.g. `pkg.utils`
    pub name: String,
    /// `true` for `__init__.py`, whose module is the package itself
    pub is_package: bool,
}

/// Derive the Python module path from a `/`-separated relative path
///
/// # Examples
/// - `utils.py` -> `utils`
/// - `utils/__init__.py` -> `utils` (package)
/// - `utils/helpers.py` -> `utils.helpers`
/// - `__init__.py` -> `__init__` (a package root has no better name)
pub fn derive_module_path(relative_path: &str) -> ModulePath {
    let without_ext = relative_path
        .strip_suffix(".pyi")
        .or_else(|| relative_path.strip_suffix(".py"))
        .unwrap_or(relative_path);

    let mut components: Vec<&str> = without_ext
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    let is_package = components.last() == Some(&"__init__");
    if is_package && components.len() > 1 {
        components.pop();
    }

    ModulePath {
        name: components.join("."),
        is_package,
    }
}

/// Resolve a relative import against the importing module
///
/// One leading dot names the current package, each further dot climbs one
/// level. For a package `__init__` the current package is the module itself.
///
/// # Arguments
/// * `current` - Module path of the importing file
/// * `relative_text` - The relative module text, e.g. `.`, `.helpers`, `..core`
/// * `import_name` - The imported name, when importing from the module
pub fn resolve_relative_import(
    current: &ModulePath,
    relative_text: &str,
    import_name: Option<&str>,
) -> String {
    let dot_count = relative_text.chars().take_while(|c| *c == '.').count();
    let module_suffix = relative_text.trim_start_matches('.');

    let mut parts: Vec<&str> = current.name.split('.').filter(|p| !p.is_empty()).collect();
    let levels = if current.is_package {
        dot_count.saturating_sub(1)
    } else {
        dot_count
    };
    for _ in 0..levels {
        parts.pop();
    }

    parts.extend(module_suffix.split('.').filter(|s| !s.is_empty()));
    if let Some(name) = import_name {
        parts.push(name);
    }
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_module() {
        let path = derive_module_path("utils.py");
        assert_eq!(path.name, "utils");
        assert!(!path.is_package);
    }

    #[test]
    fn test_package_init() {
        let path = derive_module_path("utils/__init__.py");
        assert_eq!(path.name, "utils");
        assert!(path.is_package);
    }

    #[test]
    fn test_nested_module() {
        assert_eq!(
            derive_module_path("utils/network/client.py").name,
            "utils.network.client"
        );
    }

    #[test]
    fn test_relative_imports() {
        let module = derive_module_path("mypackage/sub/utils.py");
        assert_eq!(
            resolve_relative_import(&module, ".", Some("foo")),
            "mypackage.sub.foo"
        );
        assert_eq!(
            resolve_relative_import(&module, "..core", Some("baz")),
            "mypackage.core.baz"
        );
        assert_eq!(
            resolve_relative_import(&module, ".helpers", None),
            "mypackage.sub.helpers"
        );
    }

    #[test]
    fn test_relative_import_from_package_init() {
        let package = derive_module_path("mypackage/__init__.py");
        assert_eq!(
            resolve_relative_import(&package, ".", Some("foo")),
            "mypackage.foo"
        );
    }
}
