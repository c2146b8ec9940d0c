//! Configuration file parsing and translation into immutable routing tables.
//!
//! The file format is a sequence of directives (`name arg... ;`) and blocks
//! (`server { ... }`, `location PATH { ... }`). `#` starts a line comment.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;

use anyhow::{anyhow, bail, Context, Result};
use log::debug;

use crate::http::{is_client_error, is_redirect, is_server_error, Method};

/// A name plus its ordered argument list, as written in the file.
#[derive(Debug, Clone, Default)]
pub struct DirectiveNode {
    pub name: String,
    pub args: Vec<String>,
}

/// A braced group: `server` at the top level, `location` inside a server.
#[derive(Debug, Clone, Default)]
pub struct BlockNode {
    pub kind: String,
    pub param: String,
    pub directives: Vec<DirectiveNode>,
    pub sub_blocks: Vec<BlockNode>,
}

/// A routing record matching one URL path prefix. All inheritable fields
/// are resolved against the owning server when the table is built, so a
/// `Location` is self-contained at request time.
#[derive(Debug, Clone)]
pub struct Location {
    pub path: String,
    pub allow_methods: Vec<Method>,
    pub redirect: Option<(u16, String)>,
    pub cgi: bool,
    pub index: Vec<String>,
    pub autoindex: bool,
    pub root: String,
    pub error_page: HashMap<u16, String>,
}

/// One virtual server: a listen endpoint plus its defaults and locations.
#[derive(Debug, Clone)]
pub struct Server {
    pub host: Ipv4Addr,
    pub port: u16,
    pub root: String,
    pub allow_methods: Vec<Method>,
    pub index: Vec<String>,
    pub autoindex: bool,
    pub max_request_body: usize,
    pub error_page: HashMap<u16, String>,
    pub locations: Vec<Location>,
}

impl Server {
    /// A synthetic `/` location carrying the server's own defaults, used
    /// when no configured location matches.
    pub fn default_location(&self) -> Location {
        Location {
            path: "/".to_string(),
            allow_methods: self.allow_methods.clone(),
            redirect: None,
            cgi: false,
            index: self.index.clone(),
            autoindex: self.autoindex,
            root: self.root.clone(),
            error_page: self.error_page.clone(),
        }
    }

    /// Longest-prefix match: a location matches when the path equals its
    /// prefix or continues it with a `/`.
    pub fn match_location(&self, path: &str) -> Location {
        let mut best: Option<&Location> = None;
        for location in &self.locations {
            let matches = path == location.path
                || (path.starts_with(&location.path)
                    && (location.path == "/"
                        || path.as_bytes().get(location.path.len()) == Some(&b'/')));
            if matches {
                match best {
                    Some(b) if b.path.len() >= location.path.len() => {}
                    _ => best = Some(location),
                }
            }
        }
        match best {
            Some(location) => location.clone(),
            None => self.default_location(),
        }
    }
}

const DEFAULT_METHODS: &[Method] = &[
    Method::Get,
    Method::Post,
    Method::Put,
    Method::Delete,
    Method::Head,
];

/// The configuration parser. `parse_file` builds the block tree,
/// `build_servers` validates it and materialises the server table.
#[derive(Debug, Default)]
pub struct Config {
    tokens: Vec<String>,
    idx: usize,
    root: BlockNode,
    global_error_pages: HashMap<u16, String>,
    global_max_request_body: usize,
    current_server: Option<usize>,
    current_location: String,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn parse_file(&mut self, path: &str) -> Result<()> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("unable to open config file {}", path))?;
        self.parse_str(&content)
    }

    pub fn parse_str(&mut self, content: &str) -> Result<()> {
        let stripped = strip_comments(content);
        self.tokenize(&stripped);
        debug!("config: {} token(s)", self.tokens.len());

        self.root = BlockNode {
            kind: "root".to_string(),
            ..BlockNode::default()
        };
        while !self.eof() {
            if self.is_block() {
                let block = self.parse_block()?;
                self.root.sub_blocks.push(block);
            } else {
                let directive = self.parse_directive()?;
                self.root.directives.push(directive);
            }
        }
        debug!(
            "config: parsed {} top-level block(s), {} global directive(s)",
            self.root.sub_blocks.len(),
            self.root.directives.len()
        );
        Ok(())
    }

    /// Validate the block tree and build the ordered server list.
    pub fn build_servers(&mut self) -> Result<Vec<Server>> {
        if self.root.sub_blocks.is_empty() {
            bail!("{}No server blocks defined", self.err_prefix());
        }
        for (i, block) in self.root.sub_blocks.iter().enumerate() {
            if block.kind != "server" {
                bail!(
                    "{}unexpected top-level block '{}' at index {} (expected 'server')",
                    self.err_prefix(),
                    block.kind,
                    i
                );
            }
        }

        self.global_max_request_body = 0;
        self.global_error_pages.clear();
        let globals = self.root.directives.clone();
        for directive in &globals {
            match directive.name.as_str() {
                "error_page" => {
                    self.require_args_at_least(directive, 2)?;
                    self.global_error_pages = self.parse_error_pages(&directive.args)?;
                }
                "max_request_body" => {
                    self.require_args_equal(directive, 1)?;
                    self.global_max_request_body = self.parse_positive_number(&directive.args[0])?;
                }
                _ => {
                    bail!(
                        "{}Unrecognized directive '{}' as global directive",
                        self.err_prefix(),
                        directive.name
                    );
                }
            }
        }

        let blocks = self.root.sub_blocks.clone();
        let mut servers = Vec::with_capacity(blocks.len());
        for (i, block) in blocks.iter().enumerate() {
            let server = self.translate_server(block, i)?;
            debug!(
                "config: server #{} listens on {}:{} with {} location(s)",
                i,
                server.host,
                server.port,
                server.locations.len()
            );
            servers.push(server);
        }
        Ok(servers)
    }

    // ---- tokenizer ----

    fn tokenize(&mut self, content: &str) {
        self.tokens.clear();
        let mut current = String::new();
        for chr in content.chars() {
            if matches!(chr, '{' | '}' | ';') {
                if !current.is_empty() {
                    self.tokens.push(std::mem::take(&mut current));
                }
                self.tokens.push(chr.to_string());
            } else if chr.is_whitespace() {
                if !current.is_empty() {
                    self.tokens.push(std::mem::take(&mut current));
                }
            } else {
                current.push(chr);
            }
        }
        if !current.is_empty() {
            self.tokens.push(current);
        }
        self.idx = 0;
    }

    fn eof(&self) -> bool {
        self.idx >= self.tokens.len()
    }

    fn peek(&self) -> &str {
        self.tokens.get(self.idx).map(String::as_str).unwrap_or("")
    }

    fn next_token(&mut self) -> Result<String> {
        let token = self
            .tokens
            .get(self.idx)
            .cloned()
            .ok_or_else(|| anyhow!("Unexpected end of tokens"))?;
        self.idx += 1;
        Ok(token)
    }

    /// A block is a name followed by `{`, or a name, one parameter and `{`.
    fn is_block(&self) -> bool {
        self.tokens.get(self.idx + 1).map(String::as_str) == Some("{")
            || self.tokens.get(self.idx + 2).map(String::as_str) == Some("{")
    }

    fn parse_directive(&mut self) -> Result<DirectiveNode> {
        let mut directive = DirectiveNode {
            name: self.next_token()?,
            args: Vec::new(),
        };
        while self.peek() != ";" {
            if self.eof() {
                bail!("Directive '{}' missing ';'", directive.name);
            }
            directive.args.push(self.next_token()?);
        }
        self.next_token()?; // consume ;
        Ok(directive)
    }

    fn parse_block(&mut self) -> Result<BlockNode> {
        let mut block = BlockNode {
            kind: self.next_token()?,
            ..BlockNode::default()
        };
        if block.kind == "location" {
            if self.peek() == "{" || self.peek().is_empty() {
                bail!("location missing parameter");
            }
            block.param = self.next_token()?;
        }
        if self.next_token()? != "{" {
            bail!("Expected '{{' after block type '{}'", block.kind);
        }
        while self.peek() != "}" {
            if self.eof() {
                bail!("Missing '}}' for block {}", block.kind);
            }
            if self.is_block() {
                let sub = self.parse_block()?;
                block.sub_blocks.push(sub);
            } else {
                let directive = self.parse_directive()?;
                block.directives.push(directive);
            }
        }
        self.next_token()?; // consume }
        Ok(block)
    }

    // ---- diagnostics ----

    fn err_prefix(&self) -> String {
        match self.current_server {
            Some(index) => {
                if self.current_location.is_empty() {
                    format!("Configuration error in server #{}: ", index)
                } else {
                    format!(
                        "Configuration error in server #{} location '{}': ",
                        index, self.current_location
                    )
                }
            }
            None => "Configuration error: ".to_string(),
        }
    }

    fn require_args_at_least(&self, directive: &DirectiveNode, num: usize) -> Result<()> {
        if directive.args.len() < num {
            bail!(
                "{}Directive '{}' requires at least {} argument(s)",
                self.err_prefix(),
                directive.name,
                num
            );
        }
        Ok(())
    }

    fn require_args_equal(&self, directive: &DirectiveNode, num: usize) -> Result<()> {
        if directive.args.len() != num {
            bail!(
                "{}Directive '{}' requires exactly {} argument(s)",
                self.err_prefix(),
                directive.name,
                num
            );
        }
        Ok(())
    }

    // ---- argument parsers ----

    fn parse_positive_number(&self, value: &str) -> Result<usize> {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            bail!("{}Invalid positive number '{}'", self.err_prefix(), value);
        }
        let num: usize = value
            .parse()
            .map_err(|_| anyhow!("{}Numeric value out of range: '{}'", self.err_prefix(), value))?;
        if num == 0 {
            bail!("{}Invalid positive number '{}'", self.err_prefix(), value);
        }
        Ok(num)
    }

    fn parse_port(&self, value: &str) -> Result<u16> {
        let num = self.parse_positive_number(value)?;
        if num < 1 || num > 65535 {
            bail!(
                "{}Invalid port number {} (must be 1-65535)",
                self.err_prefix(),
                num
            );
        }
        Ok(num as u16)
    }

    fn parse_bool(&self, value: &str) -> Result<bool> {
        match value {
            "on" => Ok(true),
            "off" => Ok(false),
            _ => bail!(
                "{}Invalid boolean value '{}' (expected: on/off)",
                self.err_prefix(),
                value
            ),
        }
    }

    fn parse_methods(&self, args: &[String]) -> Result<Vec<Method>> {
        let mut methods = Vec::new();
        for arg in args {
            let method = Method::from_token(arg).ok_or_else(|| {
                anyhow!("{}Unknown HTTP method '{}'", self.err_prefix(), arg)
            })?;
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        Ok(methods)
    }

    /// One or more 4xx/5xx status codes followed by a path.
    fn parse_error_pages(&self, args: &[String]) -> Result<HashMap<u16, String>> {
        if args.len() < 2 {
            bail!("{}Directive requires at least two args", self.err_prefix());
        }
        let path = &args[args.len() - 1];
        let mut pages = HashMap::new();
        for arg in &args[..args.len() - 1] {
            let code = self.parse_positive_number(arg)? as u16;
            if !(is_client_error(code) || is_server_error(code)) {
                bail!(
                    "{}Invalid error_page status code {} (must be 4xx or 5xx)",
                    self.err_prefix(),
                    code
                );
            }
            pages.insert(code, path.clone());
        }
        Ok(pages)
    }

    fn parse_redirect(&self, args: &[String]) -> Result<(u16, String)> {
        let code = self
            .parse_positive_number(&args[0])
            .ok()
            .and_then(|num| if num <= u16::MAX as usize { Some(num as u16) } else { None })
            .filter(|&code| is_redirect(code))
            .ok_or_else(|| {
                anyhow!(
                    "{}Invalid redirect status code {} (valid: 301, 302, 303, 307, 308)",
                    self.err_prefix(),
                    args[0]
                )
            })?;
        Ok((code, args[1].clone()))
    }

    /// `"host:port"` or `"port"`; the host defaults to the any-address.
    fn parse_listen(&self, arg: &str) -> Result<(Ipv4Addr, u16)> {
        match arg.find(':') {
            Some(colon) => {
                let host: Ipv4Addr = arg[..colon].parse().map_err(|_| {
                    anyhow!(
                        "{}Invalid IP address in listen directive: {}",
                        self.err_prefix(),
                        arg
                    )
                })?;
                let port = self.parse_port(&arg[colon + 1..])?;
                Ok((host, port))
            }
            None => Ok((Ipv4Addr::UNSPECIFIED, self.parse_port(arg)?)),
        }
    }

    // ---- translation ----

    fn translate_server(&mut self, block: &BlockNode, index: usize) -> Result<Server> {
        self.current_server = Some(index);
        self.current_location.clear();

        let mut listen: Option<(Ipv4Addr, u16)> = None;
        let mut root: Option<String> = None;
        let mut allow_methods: Option<Vec<Method>> = None;
        let mut index_files: Option<Vec<String>> = None;
        let mut autoindex: Option<bool> = None;
        let mut max_request_body: Option<usize> = None;
        let mut error_page: HashMap<u16, String> = HashMap::new();

        for directive in &block.directives {
            match directive.name.as_str() {
                "listen" => {
                    self.require_args_equal(directive, 1)?;
                    listen = Some(self.parse_listen(&directive.args[0])?);
                }
                "root" => {
                    self.require_args_equal(directive, 1)?;
                    root = Some(directive.args[0].clone());
                }
                "index" => {
                    self.require_args_at_least(directive, 1)?;
                    index_files = Some(directive.args.clone());
                }
                "autoindex" => {
                    self.require_args_equal(directive, 1)?;
                    autoindex = Some(self.parse_bool(&directive.args[0])?);
                }
                "allow_methods" => {
                    self.require_args_at_least(directive, 1)?;
                    allow_methods = Some(self.parse_methods(&directive.args)?);
                }
                "error_page" => {
                    self.require_args_at_least(directive, 2)?;
                    error_page.extend(self.parse_error_pages(&directive.args)?);
                }
                "max_request_body" => {
                    self.require_args_equal(directive, 1)?;
                    max_request_body = Some(self.parse_positive_number(&directive.args[0])?);
                }
                _ => bail!(
                    "{}Unrecognized directive '{}' in server block",
                    self.err_prefix(),
                    directive.name
                ),
            }
        }

        let (host, port) = listen.ok_or_else(|| {
            anyhow!(
                "{}server #{} missing 'listen' directive or invalid port",
                self.err_prefix(),
                index
            )
        })?;
        let root = root
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "{}server #{} missing 'root' directive",
                    self.err_prefix(),
                    index
                )
            })?;

        if error_page.is_empty() {
            error_page = self.global_error_pages.clone();
        }

        let mut server = Server {
            host,
            port,
            root,
            allow_methods: allow_methods.unwrap_or_else(|| DEFAULT_METHODS.to_vec()),
            index: index_files.unwrap_or_default(),
            autoindex: autoindex.unwrap_or(false),
            max_request_body: match max_request_body {
                Some(n) => n,
                None => self.global_max_request_body,
            },
            error_page,
            locations: Vec::new(),
        };

        for sub in &block.sub_blocks {
            if sub.kind != "location" {
                bail!(
                    "{}Unrecognized block '{}' in server block",
                    self.err_prefix(),
                    sub.kind
                );
            }
            let location = self.translate_location(sub, &server)?;
            server.locations.push(location);
        }

        self.current_server = None;
        self.current_location.clear();
        Ok(server)
    }

    fn translate_location(&mut self, block: &BlockNode, server: &Server) -> Result<Location> {
        self.current_location = block.param.clone();

        let mut root: Option<String> = None;
        let mut allow_methods: Option<Vec<Method>> = None;
        let mut index_files: Option<Vec<String>> = None;
        let mut autoindex: Option<bool> = None;
        let mut redirect: Option<(u16, String)> = None;
        let mut cgi = false;
        let mut error_page: HashMap<u16, String> = HashMap::new();

        for directive in &block.directives {
            match directive.name.as_str() {
                "root" => {
                    self.require_args_equal(directive, 1)?;
                    root = Some(directive.args[0].clone());
                }
                "index" => {
                    self.require_args_at_least(directive, 1)?;
                    index_files = Some(directive.args.clone());
                }
                "autoindex" => {
                    self.require_args_equal(directive, 1)?;
                    autoindex = Some(self.parse_bool(&directive.args[0])?);
                }
                "allow_methods" => {
                    self.require_args_at_least(directive, 1)?;
                    allow_methods = Some(self.parse_methods(&directive.args)?);
                }
                "redirect" => {
                    self.require_args_equal(directive, 2)?;
                    redirect = Some(self.parse_redirect(&directive.args)?);
                }
                "error_page" => {
                    self.require_args_at_least(directive, 2)?;
                    error_page.extend(self.parse_error_pages(&directive.args)?);
                }
                "cgi" => {
                    self.require_args_equal(directive, 1)?;
                    cgi = self.parse_bool(&directive.args[0])?;
                }
                _ => bail!(
                    "{}Unrecognized directive '{}' in location block",
                    self.err_prefix(),
                    directive.name
                ),
            }
        }

        // Inherit everything the location leaves unset, so the finished
        // record never needs to consult the server again.
        let mut merged_pages = server.error_page.clone();
        merged_pages.extend(error_page);

        let location = Location {
            path: block.param.clone(),
            allow_methods: allow_methods.unwrap_or_else(|| server.allow_methods.clone()),
            redirect,
            cgi,
            index: index_files.unwrap_or_else(|| server.index.clone()),
            autoindex: autoindex.unwrap_or(server.autoindex),
            root: root
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| server.root.clone()),
            error_page: merged_pages,
        };

        self.current_location.clear();
        Ok(location)
    }
}

/// Strip `#...\n` line comments, keeping the newline.
fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_comment = false;
    for chr in input.chars() {
        if in_comment {
            if chr == '\n' {
                in_comment = false;
                out.push(chr);
            }
        } else if chr == '#' {
            in_comment = true;
        } else {
            out.push(chr);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
        # sample configuration\n\
        max_request_body 2048;\n\
        error_page 500 502 /50x.html;\n\
        server {\n\
            listen 127.0.0.1:8081;\n\
            root /srv/www;\n\
            index index.html index.htm;\n\
            autoindex on;\n\
            allow_methods GET HEAD;\n\
            location /api {\n\
                allow_methods GET POST DELETE;\n\
                autoindex off;\n\
            }\n\
            location /old {\n\
                redirect 301 /new;\n\
            }\n\
            location /cgi-bin {\n\
                cgi on;\n\
                root /srv/scripts;\n\
            }\n\
        }\n\
        server {\n\
            listen 9090;\n\
            root /srv/other;\n\
            max_request_body 16;\n\
            error_page 404 /missing.html;\n\
        }\n";

    fn build(sample: &str) -> Result<Vec<Server>> {
        let mut config = Config::new();
        config.parse_str(sample)?;
        config.build_servers()
    }

    #[test]
    fn build_servers_works() {
        let servers = build(SAMPLE).unwrap();
        assert_eq!(servers.len(), 2);

        let first = &servers[0];
        assert_eq!(first.host, "127.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(first.port, 8081);
        assert_eq!(first.root, "/srv/www");
        assert_eq!(first.index, vec!["index.html", "index.htm"]);
        assert!(first.autoindex);
        assert_eq!(first.allow_methods, vec![Method::Get, Method::Head]);
        // inherits the global limit and the global error pages
        assert_eq!(first.max_request_body, 2048);
        assert_eq!(first.error_page.get(&500), Some(&"/50x.html".to_string()));
        assert_eq!(first.locations.len(), 3);

        let api = &first.locations[0];
        assert_eq!(api.path, "/api");
        assert_eq!(
            api.allow_methods,
            vec![Method::Get, Method::Post, Method::Delete]
        );
        assert!(!api.autoindex);
        // unset fields inherit from the server
        assert_eq!(api.root, "/srv/www");
        assert_eq!(api.index, vec!["index.html", "index.htm"]);

        let old = &first.locations[1];
        assert_eq!(old.redirect, Some((301, "/new".to_string())));

        let cgi = &first.locations[2];
        assert!(cgi.cgi);
        assert_eq!(cgi.root, "/srv/scripts");

        let second = &servers[1];
        assert_eq!(second.host, Ipv4Addr::UNSPECIFIED);
        assert_eq!(second.port, 9090);
        assert_eq!(second.max_request_body, 16);
        assert_eq!(second.error_page.get(&404), Some(&"/missing.html".to_string()));
        // server-level pages replace the global set entirely
        assert_eq!(second.error_page.get(&500), None);
        // unset methods get the full default set
        assert_eq!(second.allow_methods.len(), 5);
    }

    #[test]
    fn whitespace_and_comments_do_not_change_the_tree() {
        let collapsed = SAMPLE
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let a = build(SAMPLE).unwrap();
        let b = build(&collapsed).unwrap();
        assert_eq!(format!("{:?}", a), format!("{:?}", b));
    }

    #[test]
    fn match_location_prefers_longest_prefix() {
        let servers = build(
            "server { listen 8080; root /srv; \
             location / { } location /api { } location /api/v2 { } }",
        )
        .unwrap();
        let server = &servers[0];
        assert_eq!(server.match_location("/api/v2/users").path, "/api/v2");
        assert_eq!(server.match_location("/api/other").path, "/api");
        assert_eq!(server.match_location("/api").path, "/api");
        // "/apiary" continues the prefix without a slash: not a match
        assert_eq!(server.match_location("/apiary").path, "/");
        assert_eq!(server.match_location("/else").path, "/");
    }

    #[test]
    fn match_location_synthesises_default() {
        let servers = build("server { listen 8080; root /srv; autoindex on; }").unwrap();
        let location = servers[0].match_location("/anything");
        assert_eq!(location.path, "/");
        assert_eq!(location.root, "/srv");
        assert!(location.autoindex);
        assert!(!location.cgi);
    }

    fn build_err(sample: &str) -> String {
        format!("{:#}", build(sample).unwrap_err())
    }

    #[test]
    fn rejects_unknown_directive_with_context() {
        let msg = build_err("server { listen 8080; root /srv; bogus on; }");
        assert!(msg.contains("server #0"), "{}", msg);
        assert!(msg.contains("Unrecognized directive 'bogus'"), "{}", msg);

        let msg = build_err("server { listen 8080; root /srv; location /x { bogus on; } }");
        assert!(msg.contains("location '/x'"), "{}", msg);
    }

    #[test]
    fn rejects_missing_requirements() {
        assert!(build_err("server { root /srv; }").contains("missing 'listen'"));
        assert!(build_err("server { listen 8080; }").contains("missing 'root'"));
        assert!(build_err("").contains("No server blocks defined"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(build_err("server { listen 123456; root /srv; }").contains("Invalid port"));
        assert!(build_err("server { listen 1.2.3:80; root /srv; }").contains("Invalid IP address"));
        assert!(
            build_err("server { listen 8080; root /srv; allow_methods PATCH; }")
                .contains("Unknown HTTP method 'PATCH'")
        );
        assert!(
            build_err("server { listen 8080; root /srv; autoindex yes; }")
                .contains("Invalid boolean value 'yes'")
        );
        assert!(
            build_err("server { listen 8080; root /srv; error_page 200 /x.html; }")
                .contains("must be 4xx or 5xx")
        );
        assert!(
            build_err("server { listen 8080; root /srv; location /x { redirect 404 /y; } }")
                .contains("Invalid redirect status code")
        );
        assert!(
            build_err("server { listen 8080; root /srv; max_request_body -5; }")
                .contains("Invalid positive number")
        );
    }

    #[test]
    fn rejects_broken_syntax() {
        assert!(build("server { listen 8080; root /srv;").is_err());
        assert!(build("server { listen 8080 root /srv; }").is_err());
        assert!(build("upstream { listen 8080; }").is_err());
    }

    #[test]
    fn redirect_accepts_all_redirect_codes() {
        for &code in &[301u16, 302, 303, 307, 308] {
            let sample = format!(
                "server {{ listen 8080; root /srv; location /r {{ redirect {} /t; }} }}",
                code
            );
            let servers = build(&sample).unwrap();
            assert_eq!(servers[0].locations[0].redirect, Some((code, "/t".to_string())));
        }
    }
}
