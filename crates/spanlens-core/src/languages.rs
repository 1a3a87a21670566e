/// Detect language from file extension and return canonical language label.
pub fn detect_language_from_extension(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "rs" => Some("rust"),
        "ts" | "tsx" => Some("typescript"),
        "js" | "jsx" | "mjs" | "cjs" => Some("javascript"),
        "py" | "pyi" => Some("python"),
        "go" => Some("go"),
        "java" => Some("java"),
        "c" | "h" => Some("c"),
        "cpp" | "cc" | "cxx" | "hpp" => Some("cpp"),
        "cs" => Some("csharp"),
        "rb" => Some("ruby"),
        "php" => Some("php"),
        "swift" => Some("swift"),
        "kt" | "kts" => Some("kotlin"),
        "scala" => Some("scala"),
        "sh" | "bash" => Some("shell"),
        "sql" => Some("sql"),
        "md" | "markdown" => Some("markdown"),
        "rst" => Some("restructuredtext"),
        "txt" => Some("text"),
        _ => None,
    }
}

/// Extensions treated as source code by ranking heuristics.
pub const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "pyi", "ts", "tsx", "js", "jsx", "mjs", "cjs", "go", "java", "c", "h", "cpp",
    "cc", "cxx", "hpp", "cs", "rb", "php", "swift", "kt", "kts", "scala", "sh", "bash", "sql",
];

/// Extensions treated as prose documentation.
pub const DOC_EXTENSIONS: &[&str] = &["md", "markdown", "rst", "txt", "adoc"];

fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit(['/', '\\']).next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_code_path(path: &str) -> bool {
    extension_of(path).is_some_and(|ext| CODE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_doc_path(path: &str) -> bool {
    extension_of(path).is_some_and(|ext| DOC_EXTENSIONS.contains(&ext.as_str()))
}

/// Language for a path, by extension.
pub fn detect_language_for_path(path: &str) -> Option<&'static str> {
    extension_of(path).and_then(|ext| detect_language_from_extension(&ext))
}
