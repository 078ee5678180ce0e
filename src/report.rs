//! Operator-facing console output
//!
//! Write errors are ignored throughout: reporting must never abort setup.

use crate::config::Config;
use crate::ephemeral::ScheduledTeardown;
use crate::runtime::ComposeCli;
use crate::teardown::TeardownRecord;
use std::io::{self, Write};

pub struct Reporter<W> {
    out: W,
}

impl Reporter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn status(&mut self, message: &str) {
        self.tagged("INFO", message);
    }

    pub fn success(&mut self, message: &str) {
        self.tagged("SUCCESS", message);
    }

    pub fn warning(&mut self, message: &str) {
        self.tagged("WARNING", message);
    }

    pub fn error(&mut self, message: &str) {
        self.tagged("ERROR", message);
    }

    pub fn line(&mut self, text: &str) {
        let _ = writeln!(self.out, "{}", text);
    }

    fn tagged(&mut self, tag: &str, message: &str) {
        let _ = writeln!(self.out, "[{}] {}", tag, message);
    }

    /// Final summary after a setup run
    pub fn summary(
        &mut self,
        config: &Config,
        compose: &ComposeCli,
        test_domain: Option<&str>,
        scheduled: Option<&ScheduledTeardown>,
    ) {
        let paths = &config.paths;
        let compose_cmd = compose.display_name();

        self.success("Traefik setup completed!");
        self.line("");
        self.line("Summary:");
        self.line("--------");
        self.line(&format!("- Traefik configuration: {}", paths.config_dir.display()));
        self.line(&format!("- Certificate storage: {}", paths.acme_storage_file().display()));
        self.line(&format!("- Docker Compose files: {}", paths.compose_dir.display()));
        self.line(&format!("- Docker network: {}", config.proxy.network));
        self.line("");

        match test_domain {
            Some(domain) => {
                self.line("Your test page is available at:");
                self.line(&format!("  - https://{}", domain));
                self.line("");
                if let Some(scheduled) = scheduled {
                    self.line(&format!(
                        "Test page will auto-remove in 10 minutes (at {})",
                        scheduled.fire_at_local()
                    ));
                    if scheduled.watcher_pid.is_none() {
                        self.line("  The removal watcher did not start; run `traefik-bootstrap sweep`.");
                    }
                    self.line("");
                }
                self.line("Traefik dashboard:");
                self.line(&format!("  - https://traefik.{}", domain));
            }
            None => {
                self.line("No test domain provided - only Traefik is running.");
                self.line("You can add services by:");
                self.line(&format!("1. Adding them to the '{}' network", config.proxy.network));
                self.line("2. Setting appropriate Traefik labels");
            }
        }
        self.line("");
        self.line("Note: the dashboard API runs in insecure mode. Do not expose it in production.");
        self.line("");
        self.line("To manage Traefik:");
        self.line(&format!(
            "  cd {} && {} [logs|restart|down]",
            paths.compose_dir.display(),
            compose_cmd
        ));

        if test_domain.is_some() {
            self.line("");
            self.line("To manually remove test page early:");
            self.line("  traefik-bootstrap remove-test-page");
            self.line(&format!(
                "  (or: cd {} && {} -f {} down)",
                paths.compose_dir.display(),
                compose_cmd,
                paths
                    .test_manifest()
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            ));
        }
    }

    /// Table of teardown records for the `status` command
    pub fn records(&mut self, title: &str, records: &[TeardownRecord]) {
        self.line(title);
        if records.is_empty() {
            self.line("  (none)");
            return;
        }
        for record in records {
            let fire_at = record
                .fire_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S");
            match record.failure {
                Some(ref failure) => self.line(&format!(
                    "  {}  {}  due {}  FAILED: {}",
                    record.id, record.domain, fire_at, failure
                )),
                None => self.line(&format!("  {}  {}  due {}", record.id, record.domain, fire_at)),
            }
        }
    }
}
