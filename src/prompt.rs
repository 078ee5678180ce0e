//! Interactive input collection

use std::io::{self, BufRead, Write};

/// Values collected from the operator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupInputs {
    /// ACME contact, `None` falls back to the configured default
    pub contact_email: Option<String>,
    /// Domain for the disposable test page, `None` skips it entirely
    pub test_domain: Option<String>,
}

/// Outcome of the prompt sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    Proceed(SetupInputs),
    Cancelled,
}

/// Asks the setup questions over arbitrary reader/writer pairs
pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl Prompter<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Ask for email and test domain, then confirm the timed removal.
    ///
    /// The confirmation is only asked when a domain was given.
    pub fn collect(&mut self) -> io::Result<PromptOutcome> {
        writeln!(self.output, "[INFO] Traefik Setup Configuration")?;
        writeln!(self.output, "==================================")?;

        let contact_email = self.ask_validated(
            "Enter your email for Let's Encrypt (optional): ",
            validate_email,
        )?;
        let test_domain = self.ask_validated(
            "Enter test domain/subdomain (optional, e.g., test.yourdomain.com): ",
            validate_domain,
        )?;

        if test_domain.is_some() {
            let answer = self
                .ask("Test page will auto-remove in 10 minutes. Continue? (y/n): ")?
                .unwrap_or_default()
                .to_lowercase();
            if answer != "y" && answer != "yes" {
                return Ok(PromptOutcome::Cancelled);
            }
        }

        Ok(PromptOutcome::Proceed(SetupInputs {
            contact_email,
            test_domain,
        }))
    }

    /// Re-ask until the answer is empty or passes `validate`
    fn ask_validated(
        &mut self,
        question: &str,
        validate: fn(&str) -> Result<(), String>,
    ) -> io::Result<Option<String>> {
        loop {
            let Some(answer) = self.ask(question)? else {
                return Ok(None);
            };
            if answer.is_empty() {
                return Ok(None);
            }
            match validate(&answer) {
                Ok(()) => return Ok(Some(answer)),
                Err(reason) => writeln!(self.output, "[ERROR] {}", reason)?,
            }
        }
    }

    /// `None` on end of input
    fn ask(&mut self, question: &str) -> io::Result<Option<String>> {
        write!(self.output, "{}", question)?;
        self.output.flush()?;

        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            writeln!(self.output)?;
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }
}

/// Check that `domain` is a DNS hostname safe to embed in a router rule
pub fn validate_domain(domain: &str) -> Result<(), String> {
    if domain.len() > 253 {
        return Err(format!("'{}' is longer than 253 characters", domain));
    }
    if !domain.contains('.') {
        return Err(format!("'{}' is not a fully qualified domain name", domain));
    }
    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("'{}' has an empty or oversized label", domain));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("'{}' has a label starting or ending with '-'", domain));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("'{}' contains characters not allowed in a hostname", domain));
        }
    }
    Ok(())
}

/// Minimal sanity check for the ACME contact address
pub fn validate_email(email: &str) -> Result<(), String> {
    let mut parts = email.split('@');
    let (Some(local), Some(host), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("'{}' must contain exactly one '@'", email));
    };
    if local.is_empty() || host.is_empty() {
        return Err(format!("'{}' is not a valid email address", email));
    }
    if email.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        return Err(format!("'{}' contains invalid characters", email));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &str) -> (PromptOutcome, String) {
        let mut output = Vec::new();
        let outcome = Prompter::new(input.as_bytes(), &mut output).collect().unwrap();
        (outcome, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_empty_answers_skip_confirmation() {
        let (outcome, transcript) = run("\n\n");
        assert_eq!(outcome, PromptOutcome::Proceed(SetupInputs::default()));
        assert!(!transcript.contains("Continue?"));
    }

    #[test]
    fn test_domain_confirmed() {
        let (outcome, transcript) = run("  \n test.example.com \nYes\n");
        assert_eq!(
            outcome,
            PromptOutcome::Proceed(SetupInputs {
                contact_email: None,
                test_domain: Some("test.example.com".to_string()),
            })
        );
        assert!(transcript.contains("auto-remove in 10 minutes"));
    }

    #[test]
    fn test_domain_declined() {
        let (outcome, _) = run("me@example.com\ntest.example.com\nn\n");
        assert_eq!(outcome, PromptOutcome::Cancelled);
    }

    #[test]
    fn test_eof_at_confirmation_cancels() {
        let (outcome, _) = run("\ntest.example.com\n");
        assert_eq!(outcome, PromptOutcome::Cancelled);
    }

    #[test]
    fn test_eof_everywhere_means_defaults() {
        let (outcome, _) = run("");
        assert_eq!(outcome, PromptOutcome::Proceed(SetupInputs::default()));
    }

    #[test]
    fn test_invalid_domain_reprompts() {
        let (outcome, transcript) = run("\nbad domain`\nok.example.com\ny\n");
        assert_eq!(
            outcome,
            PromptOutcome::Proceed(SetupInputs {
                contact_email: None,
                test_domain: Some("ok.example.com".to_string()),
            })
        );
        assert!(transcript.contains("[ERROR]"));
    }

    #[test]
    fn test_invalid_email_reprompts() {
        let (outcome, transcript) = run("not-an-email\nops@example.com\n\n");
        assert_eq!(
            outcome,
            PromptOutcome::Proceed(SetupInputs {
                contact_email: Some("ops@example.com".to_string()),
                test_domain: None,
            })
        );
        assert!(transcript.contains("exactly one '@'"));
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("test.example.com").is_ok());
        assert!(validate_domain("a-b.c1.io").is_ok());
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("-bad.example.com").is_err());
        assert!(validate_domain("bad..example.com").is_err());
        assert!(validate_domain("x`) || Host(`evil.com").is_err());
        assert!(validate_domain(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("admin@example.com").is_ok());
        assert!(validate_email("admin").is_err());
        assert!(validate_email("a@b@c").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("a b@example.com").is_err());
    }
}
