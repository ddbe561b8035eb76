//! Rendering of remote artifacts: Kubernetes manifests, nginx server
//! blocks, env files and the heredoc commands that write them.
//!
//! Map-derived output is sorted by key so re-rendering is stable across
//! runs (and across retries of the same task).

use std::collections::HashMap;

/// Sentinel for heredoc writes; unlikely to collide with file content.
const HEREDOC_MARKER: &str = "ORCHESTRA_EOF";

/// Command that writes `content` to `path` on the remote side.
pub fn heredoc_write(path: &str, content: &str) -> String {
    format!("cat > {path} << '{HEREDOC_MARKER}'\n{content}\n{HEREDOC_MARKER}")
}

fn sorted<'a>(map: &'a HashMap<String, String>) -> Vec<(&'a String, &'a String)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by_key(|(k, _)| k.as_str());
    entries
}

/// `-e K='V'` arguments for docker run / docker service create.
pub fn env_args(vars: &HashMap<String, String>) -> String {
    sorted(vars)
        .into_iter()
        .map(|(k, v)| format!("-e {}='{}'", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn port_mapping(port: u16) -> String {
    if port > 0 {
        format!("-p {port}:{port}")
    } else {
        String::new()
    }
}

/// Key=value lines for an environment file.
pub fn env_file(vars: &HashMap<String, String>) -> String {
    sorted(vars)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One apps/v1 Deployment plus a ClusterIP Service.
pub fn k8s_manifest(
    name: &str,
    namespace: &str,
    image: &str,
    replicas: u32,
    env: &HashMap<String, String>,
    port: u16,
) -> String {
    let mut env_yaml = String::new();
    if !env.is_empty() {
        env_yaml.push_str("        env:\n");
        for (k, v) in sorted(env) {
            env_yaml.push_str(&format!("        - name: {}\n          value: \"{}\"\n", k, v));
        }
    }

    let port_yaml = if port > 0 {
        format!("        ports:\n        - containerPort: {}", port)
    } else {
        String::new()
    };

    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}
  namespace: {namespace}
spec:
  replicas: {replicas}
  selector:
    matchLabels:
      app: {name}
  template:
    metadata:
      labels:
        app: {name}
    spec:
      containers:
      - name: {name}
        image: {image}
{env_yaml}{port_yaml}
---
apiVersion: v1
kind: Service
metadata:
  name: {name}
  namespace: {namespace}
spec:
  selector:
    app: {name}
  ports:
  - port: {port}
    targetPort: {port}
  type: ClusterIP"#
    )
}

/// Reverse-proxy server block with WebSocket-friendly headers.
pub fn nginx_server_block(domain: &str, upstream_port: u16) -> String {
    format!(
        r#"server {{
    listen 80;
    server_name {domain};

    location / {{
        proxy_pass http://127.0.0.1:{upstream_port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection 'upgrade';
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
    }}
}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_heredoc_wraps_content() {
        let cmd = heredoc_write("/tmp/x.yaml", "hello: world");
        assert!(cmd.starts_with("cat > /tmp/x.yaml << 'ORCHESTRA_EOF'\n"));
        assert!(cmd.ends_with("\nORCHESTRA_EOF"));
        assert!(cmd.contains("hello: world"));
    }

    #[test]
    fn test_env_args_sorted_and_quoted() {
        let args = env_args(&vars(&[("B", "2"), ("A", "1")]));
        assert_eq!(args, "-e A='1' -e B='2'");
        assert_eq!(env_args(&HashMap::new()), "");
    }

    #[test]
    fn test_port_mapping() {
        assert_eq!(port_mapping(8080), "-p 8080:8080");
        assert_eq!(port_mapping(0), "");
    }

    #[test]
    fn test_env_file_lines() {
        let content = env_file(&vars(&[("DB_URL", "postgres://x"), ("API_KEY", "k")]));
        assert_eq!(content, "API_KEY=k\nDB_URL=postgres://x");
    }

    #[test]
    fn test_k8s_manifest_shape() {
        let manifest = k8s_manifest(
            "my-app",
            "default",
            "orchestra/my-app:v3",
            2,
            &vars(&[("PORT", "3000")]),
            3000,
        );

        assert!(manifest.contains("apiVersion: apps/v1"));
        assert!(manifest.contains("replicas: 2"));
        assert!(manifest.contains("image: orchestra/my-app:v3"));
        assert!(manifest.contains("- name: PORT\n          value: \"3000\""));
        assert!(manifest.contains("containerPort: 3000"));
        assert!(manifest.contains("type: ClusterIP"));
        assert!(manifest.contains("targetPort: 3000"));
        // Deployment and Service are a single apply
        assert!(manifest.contains("---"));
    }

    #[test]
    fn test_k8s_manifest_without_env_or_port() {
        let manifest = k8s_manifest("app", "ns", "img:v1", 1, &HashMap::new(), 0);
        assert!(!manifest.contains("env:"));
        assert!(!manifest.contains("containerPort"));
    }

    #[test]
    fn test_nginx_block_headers() {
        let block = nginx_server_block("example.com", 3000);
        assert!(block.contains("listen 80;"));
        assert!(block.contains("server_name example.com;"));
        assert!(block.contains("proxy_pass http://127.0.0.1:3000;"));
        for header in [
            "Upgrade $http_upgrade",
            "Connection 'upgrade'",
            "Host $host",
            "X-Real-IP $remote_addr",
            "X-Forwarded-For $proxy_add_x_forwarded_for",
            "X-Forwarded-Proto $scheme",
        ] {
            assert!(block.contains(header), "missing header {}", header);
        }
        assert!(block.contains("proxy_cache_bypass $http_upgrade;"));
    }
}
