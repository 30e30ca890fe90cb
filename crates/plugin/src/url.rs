use url::Url;

/// The capability-restricted URL handed to plugin hooks.
///
/// All components are readable; only `pathname`, `search`, and `hash`
/// accept writes. Writes to any other component are dropped with a
/// logged warning, and only the writable components are ever copied
/// back onto the real target URL.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginUrl {
    protocol: String,
    host: String,
    hostname: String,
    port: String,
    origin: String,
    pathname: String,
    search: String,
    hash: String,
}

impl PluginUrl {
    pub fn from_url(url: &Url) -> Self {
        let hostname = url.host_str().unwrap_or("").to_string();
        let port = url.port().map(|p| p.to_string()).unwrap_or_default();
        let host = if port.is_empty() {
            hostname.clone()
        } else {
            format!("{hostname}:{port}")
        };
        Self {
            protocol: format!("{}:", url.scheme()),
            origin: format!("{}://{host}", url.scheme()),
            host,
            hostname,
            port,
            pathname: url.path().to_string(),
            search: match url.query() {
                Some(q) if !q.is_empty() => format!("?{q}"),
                _ => String::new(),
            },
            hash: match url.fragment() {
                Some(f) if !f.is_empty() => format!("#{f}"),
                _ => String::new(),
            },
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn href(&self) -> String {
        format!("{}{}{}{}", self.origin, self.pathname, self.search, self.hash)
    }

    pub fn set_pathname(&mut self, pathname: impl Into<String>) {
        let pathname = pathname.into();
        self.pathname = if pathname.starts_with('/') {
            pathname
        } else {
            format!("/{pathname}")
        };
    }

    pub fn set_search(&mut self, search: impl Into<String>) {
        let search = search.into();
        self.search = if search.is_empty() || search.starts_with('?') {
            search
        } else {
            format!("?{search}")
        };
    }

    pub fn set_hash(&mut self, hash: impl Into<String>) {
        let hash = hash.into();
        self.hash = if hash.is_empty() || hash.starts_with('#') {
            hash
        } else {
            format!("#{hash}")
        };
    }

    pub fn set_protocol(&mut self, _value: &str) {
        Self::refuse("protocol");
    }

    pub fn set_host(&mut self, _value: &str) {
        Self::refuse("host");
    }

    pub fn set_hostname(&mut self, _value: &str) {
        Self::refuse("hostname");
    }

    pub fn set_port(&mut self, _value: &str) {
        Self::refuse("port");
    }

    pub fn set_origin(&mut self, _value: &str) {
        Self::refuse("origin");
    }

    fn refuse(field: &str) {
        tracing::warn!(field, "plugin attempted to write a readonly URL field; ignored");
    }

    /// Copy the writable components back onto the real target URL.
    pub fn apply_to(&self, target: &mut Url) {
        target.set_path(&self.pathname);
        match self.search.strip_prefix('?') {
            Some(q) if !q.is_empty() => target.set_query(Some(q)),
            _ => target.set_query(None),
        }
        match self.hash.strip_prefix('#') {
            Some(f) if !f.is_empty() => target.set_fragment(Some(f)),
            _ => target.set_fragment(None),
        }
    }
}
