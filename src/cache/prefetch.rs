//! Prefetch rules: guesses about what a program will touch next.
//!
//! Every rule is a pure function from a path (plus whatever the host file
//! system says about it) to a list of suggestions. Access rules fire when a
//! path's metadata is fetched, read rules when its contents are. A
//! suggestion names a path and whether its contents should travel along or
//! only its metadata.
//!
//! Rules are intentionally not recursive: the target of a symlink is
//! suggested, but a symlink chain does not fan out into a chain of
//! suggestions. Extrapolating further than one step has a poor hit rate and
//! the misses are pure wasted bandwidth.

use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use log::warn;

/// One rule output: prefetch `path`, with contents or metadata only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchSuggestion {
    pub path: String,
    pub contents: bool,
}

impl PrefetchSuggestion {
    fn metadata(path: impl Into<String>) -> Self {
        PrefetchSuggestion {
            path: path.into(),
            contents: false,
        }
    }

    fn contents(path: impl Into<String>) -> Self {
        PrefetchSuggestion {
            path: path.into(),
            contents: true,
        }
    }
}

/// Rules for a path whose metadata was just fetched.
pub fn file_access(path: &str) -> Vec<PrefetchSuggestion> {
    let mut suggestions = Vec::new();

    suggestions.extend(symlink_target(path));
    suggestions.extend(python_bytecode(path));
    suggestions.extend(perl_compiled_module(path));

    suggestions
}

/// Rules for a path whose contents were just read.
pub fn file_read(path: &str) -> Vec<PrefetchSuggestion> {
    elf_dependencies(path)
}

/// A symlink's target is almost always looked up right after the link.
fn symlink_target(path: &str) -> Vec<PrefetchSuggestion> {
    let is_link = std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false);
    if !is_link {
        return Vec::new();
    }

    let target = match std::fs::read_link(path) {
        Ok(target) => target,
        Err(_) => return Vec::new(),
    };

    let resolved = normalize(&Path::new(path).join("..").join(target));
    match resolved.to_str() {
        Some(resolved) => vec![PrefetchSuggestion::metadata(resolved)],
        None => Vec::new(),
    }
}

/// CPython checks `__pycache__` for compiled bytecode next to every source
/// file it imports; send the source, the directory and any matching `.pyc`
/// in one go.
fn python_bytecode(path: &str) -> Vec<PrefetchSuggestion> {
    if !path.ends_with(".py") || !Path::new(path).is_file() {
        return Vec::new();
    }

    let mut suggestions = vec![PrefetchSuggestion::contents(path)];

    let pycache = normalize(&Path::new(path).join("..").join("__pycache__"));
    if let Some(pycache_str) = pycache.to_str() {
        suggestions.push(PrefetchSuggestion::metadata(pycache_str));
    }

    // Bytecode files are "<module>.<interpreter tag>.pyc".
    let prefix = match Path::new(path).file_name().and_then(|n| n.to_str()) {
        Some(name) => name.trim_end_matches(".py").to_string(),
        None => return suggestions,
    };

    if let Ok(entries) = std::fs::read_dir(&pycache) {
        for entry in entries.flatten() {
            let matches = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(&prefix));
            if matches {
                if let Some(full) = entry.path().to_str() {
                    suggestions.push(PrefetchSuggestion::contents(full));
                }
            }
        }
    }

    suggestions
}

/// Perl consults the `.pm` source when loading a compiled `.pmc`, whether or
/// not the source exists.
fn perl_compiled_module(path: &str) -> Vec<PrefetchSuggestion> {
    match path.strip_suffix(".pmc") {
        Some(stem) => vec![PrefetchSuggestion::contents(format!("{stem}.pm"))],
        None => Vec::new(),
    }
}

/// Reading an ELF binary usually means executing it; its shared libraries
/// are about to be opened too. Suggest each dependency (which may be a
/// symlink) and the contents of its resolved path.
fn elf_dependencies(path: &str) -> Vec<PrefetchSuggestion> {
    if !is_elf_binary(path) {
        return Vec::new();
    }

    let dependencies = match loader_dependencies(path) {
        Ok(deps) => deps,
        Err(e) => {
            warn!("failed to read elf dependencies of {path}: {e}");
            return Vec::new();
        }
    };

    let mut suggestions = Vec::new();
    for dep in &dependencies {
        suggestions.push(PrefetchSuggestion::metadata(dep.clone()));
    }
    for dep in &dependencies {
        let resolved = std::fs::canonicalize(dep).unwrap_or_else(|_| PathBuf::from(dep));
        if let Some(resolved) = resolved.to_str() {
            suggestions.push(PrefetchSuggestion::contents(resolved));
        }
    }

    suggestions
}

fn is_elf_binary(path: &str) -> bool {
    use std::io::Read;

    let mut magic = [0u8; 4];
    match std::fs::File::open(path).and_then(|mut f| f.read_exact(&mut magic)) {
        Ok(()) => magic == [0x7f, b'E', b'L', b'F'],
        Err(_) => false,
    }
}

/// Ask the system loader query tool which libraries a binary needs.
///
/// Only lines of the form `name => path (address)` are used. A name or path
/// containing spaces, or containing the arrow itself, cannot be told apart
/// from the surrounding syntax and is skipped as unparseable.
fn loader_dependencies(path: &str) -> std::io::Result<Vec<String>> {
    let output = Command::new("ldd")
        .arg(path)
        .stderr(Stdio::null())
        .output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut dependencies = Vec::new();

    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 4 || tokens[1] != "=>" {
            continue;
        }
        if !(tokens[3].starts_with('(') && tokens[3].ends_with(')')) {
            continue;
        }

        dependencies.push(tokens[2].to_string());
    }

    Ok(dependencies)
}

/// Collapse `.` and `..` components without touching the file system.
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                match parts.last() {
                    Some(Component::Normal(_)) => {
                        parts.pop();
                    }
                    Some(Component::RootDir) => {}
                    _ => parts.push(component),
                }
            }
            other => parts.push(other),
        }
    }

    parts.iter().map(|c| c.as_os_str()).collect()
}
