//! Buildpack Dockerfile templates.
//!
//! When a checkout carries no Dockerfile, one is synthesized from the
//! application's build-type tag. An unknown tag yields an empty string:
//! the repository is assumed to provide its own Dockerfile.

use serde::Serialize;

/// Generate a Dockerfile for the given build-type tag.
pub fn generate_dockerfile(build_type: &str, build_cmd: &str, start_cmd: &str) -> String {
    match build_type {
        "node" => format!(
            r#"FROM node:18-alpine
WORKDIR /app
COPY package*.json ./
RUN npm ci
COPY . .
RUN {build_cmd}
CMD ["sh", "-c", "{start_cmd}"]"#
        ),

        "go" => format!(
            r#"FROM golang:1.22-alpine AS builder
WORKDIR /app
COPY go.mod go.sum ./
RUN go mod download
COPY . .
RUN {build_cmd}

FROM alpine:latest
WORKDIR /root/
COPY --from=builder /app/main .
CMD ["./main"]"#
        ),

        "python" => format!(
            r#"FROM python:3.9-slim
WORKDIR /app
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt
COPY . .
CMD ["sh", "-c", "{start_cmd}"]"#
        ),

        "rust" => format!(
            r#"FROM rust:1.75-alpine as builder
WORKDIR /usr/src/app
COPY . .
RUN {build_cmd}

FROM alpine:3.18
COPY --from=builder /usr/src/app/target/release/app /usr/local/bin/app
CMD ["app"]"#
        ),

        "nextjs-static" => format!(
            r#"FROM node:18-alpine AS builder
WORKDIR /app
COPY package*.json ./
RUN npm ci
COPY . .
RUN {build_cmd}

FROM nginx:alpine
COPY --from=builder /app/out /usr/share/nginx/html
COPY nginx.conf /etc/nginx/conf.d/default.conf
EXPOSE 80
CMD ["nginx", "-g", "daemon off;"]"#
        ),

        _ => String::new(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Framework {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub default_build: &'static str,
    pub default_start: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppType {
    pub id: &'static str,
    pub name: &'static str,
    pub frameworks: Vec<Framework>,
}

/// Catalog of supported application types and their defaults.
pub fn metadata() -> Vec<AppType> {
    vec![
        AppType {
            id: "web_service",
            name: "Web Service",
            frameworks: vec![
                Framework {
                    id: "node",
                    name: "Node.js",
                    description: "Javascript Runtime",
                    default_build: "npm install",
                    default_start: "npm start",
                },
                Framework {
                    id: "go",
                    name: "Go",
                    description: "High performance compiled language",
                    default_build: "go build -o main",
                    default_start: "./main",
                },
                Framework {
                    id: "python",
                    name: "Python",
                    description: "Versatile scripting language",
                    default_build: "pip install -r requirements.txt",
                    default_start: "python app.py",
                },
                Framework {
                    id: "rust",
                    name: "Rust",
                    description: "Memory safe systems language",
                    default_build: "cargo build --release",
                    default_start: "./target/release/app",
                },
            ],
        },
        AppType {
            id: "static_site",
            name: "Static Site",
            frameworks: vec![Framework {
                id: "nextjs-static",
                name: "Next.js (Static)",
                description: "React Framework (Static Export)",
                default_build: "npm run build",
                default_start: "nginx",
            }],
        },
    ]
}
