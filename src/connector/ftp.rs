//! FTP backend.
//!
//! The connection URL is `ftp://host:port/base/dir`. CREATE renders records
//! through the document template into an in-memory buffer and uploads it in
//! one STOR after the footer; rollback removes the remote file again. READ
//! downloads the target and parses it like the file backend does.
//!
//! `suppaftp` is a blocking client, so every session runs inside
//! `spawn_blocking`.

use std::io::Cursor;

use async_trait::async_trait;
use serde_json::Value;
use suppaftp::FtpStream;

use crate::error::{Result, SluiceError};
use crate::rule::MappingRule;
use crate::stream::Record;

use super::{ConnectInfo, Connector, ModuleContext};

#[derive(Debug, Clone)]
struct FtpTarget {
    host: String,
    port: u16,
    user: String,
    password: String,
    passive: bool,
    /// Remote path of the module target, base directory included.
    remote_path: String,
}

impl FtpTarget {
    fn parse(info: &ConnectInfo, target: &str) -> Result<Self> {
        let trimmed = info.url.strip_prefix("ftp://").unwrap_or(&info.url);
        let (host_port, base) = match trimmed.split_once('/') {
            Some((hp, base)) => (hp, base.trim_end_matches('/')),
            None => (trimmed, ""),
        };
        let (host, port) = match host_port.split_once(':') {
            Some((h, p)) => (
                h.to_string(),
                p.parse::<u16>()
                    .map_err(|_| SluiceError::Config(format!("bad ftp port in {}", info.url)))?,
            ),
            None => (host_port.to_string(), 21),
        };
        if host.is_empty() {
            return Err(SluiceError::Config(format!("bad ftp url {}", info.url)));
        }
        let remote_path = if base.is_empty() {
            format!("/{target}")
        } else {
            format!("/{base}/{target}")
        };
        Ok(Self {
            host,
            port,
            user: info.user.clone(),
            password: info.password.clone(),
            passive: info.passive,
            remote_path,
        })
    }

    fn open(&self) -> Result<FtpStream> {
        let mut stream = FtpStream::connect(format!("{}:{}", self.host, self.port))
            .map_err(|e| SluiceError::Connect(format!("ftp connect failed: {e}")))?;
        if self.passive {
            stream.set_mode(suppaftp::Mode::ExtendedPassive);
        } else {
            stream.set_mode(suppaftp::Mode::Active);
        }
        if !self.user.is_empty() {
            stream
                .login(&self.user, &self.password)
                .map_err(|e| SluiceError::Connect(format!("ftp login failed: {e}")))?;
        }
        stream
            .transfer_type(suppaftp::types::FileType::Binary)
            .map_err(|e| SluiceError::Ftp(e.to_string()))?;
        Ok(stream)
    }
}

async fn with_session<T, F>(target: FtpTarget, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut FtpStream, &str) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut stream = target.open()?;
        let result = op(&mut stream, &target.remote_path);
        if let Err(e) = stream.quit() {
            tracing::warn!(error = %e, "ftp quit failed");
        }
        result
    })
    .await
    .map_err(|e| SluiceError::Ftp(format!("ftp task failed: {e}")))?
}

pub struct FtpConnector {
    target: Option<FtpTarget>,
    /// Records loaded by `before_read`, drained by the read calls.
    incoming: Vec<Record>,
    retrieved: u64,
    /// Rendered output accumulated across the create phases.
    outgoing: Vec<u8>,
    uploaded: bool,
    sent: u64,
}

impl FtpConnector {
    pub fn new() -> Self {
        Self {
            target: None,
            incoming: Vec::new(),
            retrieved: 0,
            outgoing: Vec::new(),
            uploaded: false,
            sent: 0,
        }
    }

    fn target(&self) -> Result<FtpTarget> {
        self.target
            .clone()
            .ok_or_else(|| SluiceError::Connect("ftp connector is not connected".into()))
    }

    /// Download the remote document and parse it into records.
    async fn fetch_document(&self) -> Result<Vec<Record>> {
        let target = self.target()?;
        let data = with_session(target, |stream, path| {
            stream
                .retr_as_buffer(path)
                .map(Cursor::into_inner)
                .map_err(|e| SluiceError::Ftp(format!("retr failed: {e}")))
        })
        .await?;
        let doc: Value = serde_json::from_slice(&data)?;
        super::file::FileConnector::parse_records(doc)
    }
}

impl Default for FtpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for FtpConnector {
    async fn connect(&mut self, ctx: &ModuleContext) -> Result<()> {
        let target = FtpTarget::parse(&ctx.connect_info, &ctx.target()?)?;
        // probe the session up front so a bad endpoint fails in connect
        with_session(target.clone(), |_, _| Ok(())).await?;
        self.target = Some(target);
        Ok(())
    }

    async fn check(&mut self, _ctx: &ModuleContext) -> Result<bool> {
        let target = self.target()?;
        with_session(target, |stream, path| {
            Ok(stream.size(path).is_ok())
        })
        .await
    }

    async fn count(&mut self, _ctx: &ModuleContext) -> Result<u64> {
        let records = self.fetch_document().await?;
        Ok(records.len() as u64)
    }

    async fn before_read(&mut self, _ctx: &ModuleContext, _rule: &MappingRule) -> Result<()> {
        // one download; the read calls drain the buffer
        self.incoming = self.fetch_document().await?;
        self.retrieved = 0;
        Ok(())
    }

    async fn read(&mut self, ctx: &ModuleContext, _rule: &MappingRule) -> Result<Vec<Record>> {
        let records = std::mem::take(&mut self.incoming);
        self.retrieved += records.len() as u64;
        ctx.progress.report(self.retrieved);
        Ok(records)
    }

    async fn read_partially(
        &mut self,
        ctx: &ModuleContext,
        _rule: &MappingRule,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let take = limit.min(self.incoming.len());
        let records: Vec<Record> = self.incoming.drain(..take).collect();
        if !records.is_empty() {
            self.retrieved += records.len() as u64;
            ctx.progress.report(self.retrieved);
        }
        Ok(records)
    }

    async fn after_read(&mut self, _ctx: &ModuleContext) -> Result<()> {
        self.incoming.clear();
        Ok(())
    }

    async fn before_create(&mut self, ctx: &ModuleContext, rule: &MappingRule) -> Result<()> {
        self.outgoing.clear();
        self.uploaded = false;
        let header = ctx.template().make_header(&ctx.context, rule)?;
        self.outgoing.extend_from_slice(header.as_bytes());
        Ok(())
    }

    async fn create(
        &mut self,
        ctx: &ModuleContext,
        rule: &MappingRule,
        items: &[Record],
    ) -> Result<u64> {
        let body = ctx
            .template()
            .make_body(&ctx.context, rule, items, None, self.sent)?;
        self.outgoing.extend_from_slice(body.as_bytes());
        self.sent += items.len() as u64;
        ctx.progress.report(self.sent);
        Ok(self.sent)
    }

    async fn after_create(&mut self, ctx: &ModuleContext, rule: &MappingRule) -> Result<()> {
        let footer = ctx.template().make_footer(&ctx.context, rule)?;
        self.outgoing.extend_from_slice(footer.as_bytes());

        let target = self.target()?;
        let data = std::mem::take(&mut self.outgoing);
        with_session(target, move |stream, path| {
            stream
                .put_file(path, &mut Cursor::new(data))
                .map_err(|e| SluiceError::Ftp(format!("stor failed: {e}")))?;
            Ok(())
        })
        .await?;
        self.uploaded = true;
        Ok(())
    }

    async fn delete(&mut self, _ctx: &ModuleContext) -> Result<u64> {
        let target = self.target()?;
        with_session(target, |stream, path| match stream.rm(path) {
            Ok(()) => Ok(1),
            Err(suppaftp::FtpError::UnexpectedResponse(_)) => Ok(0),
            Err(e) => Err(SluiceError::Ftp(format!("rm failed: {e}"))),
        })
        .await
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self, ctx: &ModuleContext) -> Result<()> {
        self.outgoing.clear();
        if self.uploaded {
            let target = self.target()?;
            with_session(target, |stream, path| {
                stream
                    .rm(path)
                    .map_err(|e| SluiceError::Ftp(format!("rollback rm failed: {e}")))
            })
            .await?;
            self.uploaded = false;
        }
        self.sent = 0;
        ctx.progress.report(0);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.incoming.clear();
        self.outgoing.clear();
        Ok(())
    }

    fn sent(&self) -> u64 {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ProgressHandle;
    use crate::context::Context;
    use serde_json::json;

    fn info(url: &str) -> ConnectInfo {
        ConnectInfo {
            connector: "FTP".into(),
            url: url.into(),
            user: "fg".into(),
            password: "pw".into(),
            ..ConnectInfo::default()
        }
    }

    #[test]
    fn url_parsing_handles_scheme_base_and_port() {
        let t = FtpTarget::parse(&info("ftp://files.example.com:2121/out/daily"), "a.json").unwrap();
        assert_eq!(t.host, "files.example.com");
        assert_eq!(t.port, 2121);
        assert_eq!(t.remote_path, "/out/daily/a.json");

        let t = FtpTarget::parse(&info("files.example.com"), "a.json").unwrap();
        assert_eq!(t.port, 21);
        assert_eq!(t.remote_path, "/a.json");
    }

    #[test]
    fn bad_urls_are_rejected() {
        assert!(FtpTarget::parse(&info("ftp://:bad/"), "x").is_err());
        assert!(FtpTarget::parse(&info("host:notaport"), "x").is_err());
    }

    #[tokio::test]
    async fn partial_reads_drain_the_buffered_document() {
        let ctx = ModuleContext {
            module_name: "M1".into(),
            sequence: json!({ "TARGET": "a.json" }),
            connect_info: ConnectInfo::default(),
            context: Context::new(),
            progress: ProgressHandle::disabled(),
            template: None,
        };
        let rule = MappingRule::new();

        let mut c = FtpConnector::new();
        c.incoming = (0..5)
            .map(|i| json!({ "N": i }).as_object().unwrap().clone())
            .collect();

        // each call consumes its slice; an empty batch ends a pipe loop
        assert_eq!(c.read_partially(&ctx, &rule, 2).await.unwrap().len(), 2);
        assert_eq!(c.read_partially(&ctx, &rule, 2).await.unwrap().len(), 2);
        assert_eq!(c.read_partially(&ctx, &rule, 2).await.unwrap().len(), 1);
        assert!(c.read_partially(&ctx, &rule, 2).await.unwrap().is_empty());

        c.incoming = (0..3)
            .map(|i| json!({ "N": i }).as_object().unwrap().clone())
            .collect();
        assert_eq!(c.read(&ctx, &rule).await.unwrap().len(), 3);
        assert!(c.read(&ctx, &rule).await.unwrap().is_empty());
    }
}
