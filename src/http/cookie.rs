//! `set-cookie` header construction.

use std::time::SystemTime;

use bytes::Bytes;

/// `SameSite` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Lax => "lax",
            SameSite::Strict => "strict",
            SameSite::None => "none",
        }
    }
}

/// Structured cookie options rendered into one `set-cookie` header.
#[derive(Debug, Clone)]
pub struct SetCookie {
    name: String,
    value: String,
    max_age: Option<i64>,
    expires: Option<SystemTime>,
    path: Option<String>,
    domain: Option<String>,
    secure: bool,
    http_only: bool,
    same_site: SameSite,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            max_age: None,
            expires: None,
            path: None,
            domain: None,
            secure: false,
            http_only: false,
            same_site: SameSite::default(),
        }
    }

    /// Cookie that tells the client to drop `name`.
    pub fn delete(name: impl Into<String>) -> Self {
        Self::new(name, "").max_age(0).expires(std::time::UNIX_EPOCH)
    }

    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// `SameSite=None` forces `Secure`, as browsers require.
    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        if same_site == SameSite::None {
            self.secure = true;
        }
        self
    }

    /// Render the header value.
    pub fn value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={max_age}"));
        }
        if let Some(expires) = self.expires {
            out.push_str(&format!("; Expires={}", httpdate::fmt_http_date(expires)));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain={domain}"));
        }
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={path}"));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out.push_str(&format!("; SameSite={}", self.same_site.as_str()));
        out
    }

    /// The single `(name, value)` header tuple.
    pub fn header(&self) -> (Bytes, Bytes) {
        (Bytes::from_static(b"set-cookie"), Bytes::from(self.value()))
    }
}
