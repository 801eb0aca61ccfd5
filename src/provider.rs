//! The translation provider seam.
//!
//! The engine talks to exactly one external collaborator: something that can
//! translate a piece of text under a system prompt. Everything upstream of
//! this trait (HTTP clients, SDKs, local models) lives outside the crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, Severity, TranslationError};

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translates `text` under `system_prompt`.
    ///
    /// Implementations should surface upstream failures as classified
    /// errors; a plain message is acceptable and will be classified by the
    /// caller via [`TranslationError::classify`].
    async fn translate(
        &self,
        system_prompt: &str,
        text: &str,
    ) -> Result<String, TranslationError>;
}

/// Credentials and routing for a concrete provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl ProviderSettings {
    /// Checks that every field is filled in before a job starts.
    pub fn validate(&self) -> Result<(), TranslationError> {
        let fields = [
            ("api_key", &self.api_key),
            ("base_url", &self.base_url),
            ("model", &self.model),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(TranslationError::new(
                    ErrorKind::InvalidRequest,
                    format!("provider settings are incomplete: {name} is not set"),
                    Severity::High,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    pub(crate) fn settings() -> ProviderSettings {
        ProviderSettings {
            api_key: "key".to_owned(),
            base_url: "https://api.example.com/v1".to_owned(),
            model: "translator-large".to_owned(),
        }
    }

    #[test]
    fn complete_settings_validate() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn any_blank_field_is_an_invalid_request() {
        for blank in [
            ProviderSettings {
                api_key: String::new(),
                ..settings()
            },
            ProviderSettings {
                base_url: "   ".to_owned(),
                ..settings()
            },
            ProviderSettings {
                model: String::new(),
                ..settings()
            },
        ] {
            let error = blank.validate().unwrap_err();
            assert_eq!(error.kind, ErrorKind::InvalidRequest);
            assert!(!error.is_retryable());
        }
    }

    type Handler =
        Box<dyn Fn(&str, &str) -> Result<String, TranslationError> + Send + Sync>;

    /// A scripted in-memory translator for driver and engine tests.
    pub(crate) struct MockTranslator {
        handler: Handler,
        delay: Option<std::time::Duration>,
        calls: Mutex<Vec<(String, String)>>,
        call_count: AtomicU32,
    }

    impl MockTranslator {
        pub(crate) fn new(handler: Handler) -> Self {
            Self {
                handler,
                delay: None,
                calls: Mutex::new(Vec::new()),
                call_count: AtomicU32::new(0),
            }
        }

        /// Makes every call take this long, for cancellation tests.
        pub(crate) fn delayed(mut self, delay: std::time::Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Translates by dictionary lookup, erroring on unknown text.
        pub(crate) fn with_map<const N: usize>(entries: [(&str, &str); N]) -> Self {
            let map: HashMap<String, String> = entries
                .into_iter()
                .map(|(from, to)| (from.to_owned(), to.to_owned()))
                .collect();
            Self::new(Box::new(move |_, text| {
                map.get(text).cloned().ok_or_else(|| {
                    TranslationError::classify(format!("no scripted translation for {text:?}"))
                })
            }))
        }

        /// Fails every call with the given HTTP status.
        pub(crate) fn always_status(status: u16) -> Self {
            Self::new(Box::new(move |_, _| {
                Err(TranslationError::from_status(status, "scripted failure"))
            }))
        }

        pub(crate) fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn call_count(&self) -> u32 {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Translator for MockTranslator {
        async fn translate(
            &self,
            system_prompt: &str,
            text: &str,
        ) -> Result<String, TranslationError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((system_prompt.to_owned(), text.to_owned()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.handler)(system_prompt, text)
        }
    }
}
