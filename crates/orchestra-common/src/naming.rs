/// Normalize a user-supplied name for use in on-disk paths, image tags,
/// Kubernetes object names, and nginx filenames.
///
/// Spaces, underscores and dots become dashes; everything is lowercased.
pub fn sanitize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | '_' | '.' => '-',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_separators() {
        assert_eq!(sanitize("My App"), "my-app");
        assert_eq!(sanitize("api_server.v2"), "api-server-v2");
    }

    #[test]
    fn test_sanitize_idempotent() {
        let inputs = ["My App", "already-clean", "Mixed_Case.Name", "a b_c.d"];
        for input in inputs {
            let once = sanitize(input);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn test_sanitize_output_charset() {
        let out = sanitize("Site Prod_v1.2");
        assert!(out.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }
}
