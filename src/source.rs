// Source file data model (spec.md §3 "Source file").
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

// Classifies a path as user code (student workspace) or system code (sysroot headers, runtime
// shims), per spec.md's path-prefix rule. `user_code_prefix` is `Settings::user_code_prefix`.
pub fn is_user_code_path(path: &str, user_code_prefix: &str) -> bool {
    path.starts_with(user_code_prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_prefix() {
        assert!(is_user_code_path("/workspace/main.cpp", "/workspace/"));
        assert!(!is_user_code_path("/usr/include/c++/v1/vector", "/workspace/"));
        assert!(!is_user_code_path("/workspace_sysroot/stub.h", "/workspace/"));
    }
}
