//! Builtin Dockerfile templates
//!
//! Projects without a Dockerfile can pick one of these by name. Templates are
//! rendered with Tera; per-builtin settings fill the template variables and
//! can be overridden by the caller.

use crate::error::{BuildError, BuildResult};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tera::{Context, Tera};

pub struct Builtin {
    pub name: &'static str,
    pub description: &'static str,
    pub details: &'static str,
    template: &'static str,
    defaults: fn() -> BTreeMap<&'static str, Value>,
}

/// A builtin selected for a build, with caller overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltinSpec {
    pub name: String,
    pub settings: BTreeMap<String, Value>,
}

impl BuiltinSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: BTreeMap::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

fn no_settings() -> BTreeMap<&'static str, Value> {
    BTreeMap::new()
}

fn static_settings() -> BTreeMap<&'static str, Value> {
    BTreeMap::from([("httpsonly", json!(false)), ("log", json!(false))])
}

const NODE: &str = r#"FROM node:current-slim
WORKDIR /app
COPY package.json .
COPY package-lock.json .
RUN npm install --production
COPY . .
RUN npm run build --if-present
ENV PORT=8080
EXPOSE 8080
CMD [ "npm","start" ]
"#;

const RUBY: &str = r#"FROM ruby:2.7
WORKDIR /usr/src/app
COPY Gemfile ./
RUN bundle install
COPY . .
ENV PORT=8080
EXPOSE 8080
CMD ["bundle", "exec", "rackup", "--host", "0.0.0.0", "-p", "8080"]
"#;

const DENO: &str = r#"FROM hayd/debian-deno:{{ version }}
ENV PORT=8080
EXPOSE 8080
WORKDIR /app
USER deno
COPY main.ts deps.* ./
RUN /bin/bash -c "deno cache deps.ts || true"
ADD . .
RUN deno cache main.ts
CMD ["run", {% for perm in perms %}"{{ perm }}", {% endfor %}"main.ts"]
"#;

const GO: &str = r#"FROM golang:1.14 as builder
WORKDIR /go/src/app
COPY . .
RUN go mod download
RUN CGO_ENABLED=0 GOOS=linux go build -v -o app
FROM alpine:latest
COPY --from=builder /go/src/app/app /goapp/app
WORKDIR /goapp
COPY . /throwaway
RUN cp -r /throwaway/resources ./resources || echo "No resources to copy"
RUN rm -rf /throwaway
RUN apk --no-cache add ca-certificates
ENV PORT=8080
EXPOSE 8080
CMD ["/goapp/app"]
"#;

const STATIC: &str = r#"FROM pierrezemb/gostatic
COPY . /srv/http/
CMD ["-port","8080"{% if httpsonly %},"-https-promote"{% endif %}{% if log %},"-enable-logging"{% endif %}]
"#;

const HUGO_STATIC: &str = r#"FROM klakegg/hugo:0.74.0-onbuild AS hugo
FROM pierrezemb/gostatic
COPY --from=hugo /target /srv/http/
CMD ["-port","8080"{% if httpsonly %},"-https-promote"{% endif %}{% if log %},"-enable-logging"{% endif %}]
"#;

const PYTHON: &str = r#"FROM python:{{ pythonbase }}
ENV PORT 8080
RUN mkdir /app
RUN set -ex && \
    apt-get update && \
    apt-get install -y --no-install-recommends wget && \
    wget -O /usr/bin/hivemind.gz https://github.com/DarthSim/hivemind/releases/download/v{{ hiveversion }}/hivemind-v{{ hiveversion }}-linux-amd64.gz && \
    gzip -d /usr/bin/hivemind.gz && \
    chmod +x /usr/bin/hivemind
COPY . /app
WORKDIR /app
RUN pip install -r requirements.txt
CMD ["/usr/bin/hivemind", "/app/Procfile"]
"#;

static BUILTINS: &[Builtin] = &[
    Builtin {
        name: "node",
        description: "Nodejs builtin",
        details: "Requires package.json, package-lock.json and an app started by npm start. Exposes port 8080.",
        template: NODE,
        defaults: no_settings,
    },
    Builtin {
        name: "ruby",
        description: "Ruby builtin",
        details: "Runs bundle install, then rackup with config.ru. Exposes port 8080.",
        template: RUBY,
        defaults: no_settings,
    },
    Builtin {
        name: "deno",
        description: "Deno builtin",
        details: "Runs main.ts with the configured permissions, caching deps.ts when present. Exposes port 8080.",
        template: DENO,
        defaults: || {
            BTreeMap::from([
                ("perms", json!(["--allow-net"])),
                ("version", json!("1.5.4")),
            ])
        },
    },
    Builtin {
        name: "go",
        description: "Go builtin",
        details: "Builds main.go with go modules into a static binary on alpine. Exposes port 8080.",
        template: GO,
        defaults: no_settings,
    },
    Builtin {
        name: "static",
        description: "Web server builtin",
        details: "Serves every file in the project. Exposes port 8080.",
        template: STATIC,
        defaults: static_settings,
    },
    Builtin {
        name: "hugo-static",
        description: "Hugo static build with web server builtin",
        details: "Builds the site with Hugo, then serves the public files. Exposes port 8080.",
        template: HUGO_STATIC,
        defaults: static_settings,
    },
    Builtin {
        name: "python",
        description: "Python builtin",
        details: "Installs requirements.txt and runs the Procfile with hivemind. Exposes port 8080.",
        template: PYTHON,
        defaults: || {
            BTreeMap::from([
                ("hiveversion", json!("1.0.6")),
                ("pythonbase", json!("3.8-slim-buster")),
            ])
        },
    },
];

pub fn list_builtins() -> &'static [Builtin] {
    BUILTINS
}

pub fn find_builtin(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

/// Render the Dockerfile for `spec`
pub fn render_builtin(spec: &BuiltinSpec) -> BuildResult<String> {
    let builtin =
        find_builtin(&spec.name).ok_or_else(|| BuildError::UnknownBuiltin(spec.name.clone()))?;

    let mut context = Context::new();
    for (key, value) in (builtin.defaults)() {
        context.insert(key, &value);
    }
    for (key, value) in &spec.settings {
        context.insert(key.as_str(), value);
    }

    Tera::one_off(builtin.template, &context, false).map_err(|e| BuildError::BuiltinRender {
        name: spec.name.clone(),
        message: e.to_string(),
    })
}
