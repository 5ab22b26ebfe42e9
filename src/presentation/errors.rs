//! Humanized error catalog.
//!
//! Every user-visible failure resolves to a catalog entry; unknown codes
//! fall back to a generic entry so no raw error object ever reaches the
//! chat. Recovery actions are callback tokens handled by the router.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::presentation::messages::Register;
use crate::telegram::{Keyboard, KeyboardButton};
use crate::types::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    fn glyph(&self) -> &'static str {
        match self {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Error => "❌",
        }
    }
}

/// One catalog entry.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub code: &'static str,
    pub message: &'static str,
    pub suggestions: &'static [&'static str],
    /// (button label, callback token)
    pub recovery_actions: &'static [(&'static str, &'static str)],
    pub severity: Severity,
}

static CATALOG: Lazy<HashMap<&'static str, CatalogEntry>> = Lazy::new(|| {
    let entries = [
        CatalogEntry {
            code: "empty_query",
            message: "A busca precisa de um texto.",
            suggestions: &["Envie uma palavra ou frase para procurar."],
            recovery_actions: &[("Buscar de novo", "action:search")],
            severity: Severity::Info,
        },
        CatalogEntry {
            code: "empty_session",
            message: "Esta sessão ainda não tem áudios.",
            suggestions: &["Envie uma mensagem de voz antes de finalizar."],
            recovery_actions: &[],
            severity: Severity::Info,
        },
        CatalogEntry {
            code: "empty_audio",
            message: "O áudio chegou vazio.",
            suggestions: &["Tente gravar novamente."],
            recovery_actions: &[],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "session_not_found",
            message: "Não encontrei essa sessão.",
            suggestions: &["Ela pode ter sido removida.", "Veja a lista de sessões."],
            recovery_actions: &[("Listar sessões", "action:sessions")],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "no_active_session",
            message: "Não há sessão aberta no momento.",
            suggestions: &["Crie uma sessão nova para começar a gravar."],
            recovery_actions: &[("Nova sessão", "action:new_session")],
            severity: Severity::Info,
        },
        CatalogEntry {
            code: "illegal_transition",
            message: "Essa ação não é possível no estado atual da sessão.",
            suggestions: &["Confira o estado da sessão antes de repetir."],
            recovery_actions: &[("Ver estado", "action:status")],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "transcription_timeout",
            message: "A transcrição demorou demais e foi interrompida.",
            suggestions: &["Os segmentos que falharam podem ser reprocessados."],
            recovery_actions: &[("Tentar novamente", "retry:transcription")],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "transcription_failed",
            message: "Não consegui transcrever parte do áudio.",
            suggestions: &["Os segmentos que falharam podem ser reprocessados."],
            recovery_actions: &[("Tentar novamente", "retry:transcription")],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "embedding_timeout",
            message: "A indexação semântica não respondeu a tempo.",
            suggestions: &["A busca continua funcionando em modo texto."],
            recovery_actions: &[],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "embedding_failed",
            message: "A indexação semântica falhou.",
            suggestions: &["A busca continua funcionando em modo texto."],
            recovery_actions: &[],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "llm_timeout",
            message: "O oráculo não respondeu a tempo.",
            suggestions: &["Tente de novo em instantes."],
            recovery_actions: &[("Chamar oráculo", "action:oracles")],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "llm_failed",
            message: "O oráculo encontrou um problema ao responder.",
            suggestions: &["Tente de novo em instantes."],
            recovery_actions: &[("Chamar oráculo", "action:oracles")],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "tts_timeout",
            message: "A síntese de voz não terminou a tempo.",
            suggestions: &["O texto já foi entregue; apenas o áudio falhou."],
            recovery_actions: &[],
            severity: Severity::Info,
        },
        CatalogEntry {
            code: "tts_failed",
            message: "A síntese de voz falhou.",
            suggestions: &["O texto já foi entregue; apenas o áudio falhou."],
            recovery_actions: &[],
            severity: Severity::Info,
        },
        CatalogEntry {
            code: "tts_disabled",
            message: "A síntese de voz está desativada.",
            suggestions: &["Ative-a na configuração para receber áudios."],
            recovery_actions: &[],
            severity: Severity::Info,
        },
        CatalogEntry {
            code: "transport_failed",
            message: "Falha de comunicação com o Telegram.",
            suggestions: &["Verifique a conexão e tente novamente."],
            recovery_actions: &[],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "corrupt_session",
            message: "Os dados desta sessão estão corrompidos.",
            suggestions: &[
                "A sessão foi movida para um canto seguro.",
                "Os áudios originais permanecem no disco.",
            ],
            recovery_actions: &[("Listar sessões", "action:sessions")],
            severity: Severity::Error,
        },
        CatalogEntry {
            code: "exhausted",
            message: "O sistema está sobrecarregado agora.",
            suggestions: &["Aguarde a fila esvaziar e tente de novo."],
            recovery_actions: &[],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "io_failure",
            message: "Houve um problema ao gravar no disco.",
            suggestions: &["Verifique o espaço livre em disco."],
            recovery_actions: &[],
            severity: Severity::Error,
        },
        CatalogEntry {
            code: "active_session_exists",
            message: "Já existe uma sessão aberta para este chat.",
            suggestions: &["Finalize ou descarte a sessão atual primeiro."],
            recovery_actions: &[("Ver estado", "action:status")],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "no_transcripts",
            message: "A sessão ainda não tem transcrições prontas.",
            suggestions: &["Finalize a sessão e aguarde a transcrição."],
            recovery_actions: &[("Ver estado", "action:status")],
            severity: Severity::Info,
        },
        CatalogEntry {
            code: "unknown_persona",
            message: "Esse oráculo não existe mais.",
            suggestions: &["Veja a lista atual de oráculos."],
            recovery_actions: &[("Listar oráculos", "action:oracles")],
            severity: Severity::Warning,
        },
        CatalogEntry {
            code: "name_already_set",
            message: "O nome desta sessão já foi definido.",
            suggestions: &[],
            recovery_actions: &[],
            severity: Severity::Info,
        },
        CatalogEntry {
            code: "invalid_token",
            message: "Esse botão não é mais válido.",
            suggestions: &["Use o menu principal para continuar."],
            recovery_actions: &[("Menu", "help:menu")],
            severity: Severity::Info,
        },
        CatalogEntry {
            code: "internal",
            message: "Algo inesperado aconteceu aqui dentro.",
            suggestions: &["O problema foi registrado. Tente novamente."],
            recovery_actions: &[],
            severity: Severity::Error,
        },
    ];
    entries.into_iter().map(|e| (e.code, e)).collect()
});

/// Generic entry for codes without a specific catalog line.
fn fallback() -> &'static CatalogEntry {
    CATALOG.get("internal").expect("internal entry exists")
}

/// Fetch the entry for a catalog code.
pub fn entry_for(code: &str) -> &'static CatalogEntry {
    CATALOG.get(code).unwrap_or_else(|| fallback())
}

/// A rendered, user-ready error.
#[derive(Debug, Clone)]
pub struct RenderedError {
    pub text: String,
    pub keyboard: Keyboard,
    pub severity: Severity,
}

/// Turn a typed error into catalog text plus recovery buttons. The
/// internal error itself is logged by callers, never shown.
pub fn humanize(error: &CoreError, register: Register) -> RenderedError {
    let entry = entry_for(error.catalog_code());

    let mut text = match register {
        Register::Decorated => format!("{} {}", entry.severity.glyph(), entry.message),
        Register::Plain => entry.message.to_string(),
    };
    for suggestion in entry.suggestions {
        text.push('\n');
        match register {
            Register::Decorated => {
                text.push_str("• ");
                text.push_str(suggestion);
            }
            Register::Plain => {
                text.push_str("- ");
                text.push_str(suggestion);
            }
        }
    }

    let mut keyboard = Keyboard::new();
    if !entry.recovery_actions.is_empty() {
        keyboard = keyboard.row(
            entry
                .recovery_actions
                .iter()
                .map(|(label, token)| KeyboardButton {
                    label: (*label).to_string(),
                    token: (*token).to_string(),
                })
                .collect(),
        );
    }

    RenderedError {
        text,
        keyboard,
        severity: entry.severity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Capability;

    #[test]
    fn test_known_code_resolves() {
        let err = CoreError::CapabilityTimeout {
            capability: Capability::Llm,
            waited_secs: 30,
        };
        let rendered = humanize(&err, Register::Decorated);
        assert!(rendered.text.contains("oráculo"));
        assert!(rendered.text.contains("⚠️"));
        assert_eq!(rendered.keyboard.rows.len(), 1);
        assert_eq!(rendered.keyboard.rows[0][0].token, "action:oracles");
    }

    #[test]
    fn test_plain_register_has_no_glyphs() {
        let err = CoreError::validation("empty_query", "x");
        let rendered = humanize(&err, Register::Plain);
        assert!(!rendered.text.contains("ℹ️"));
        assert!(rendered.text.starts_with("A busca"));
    }

    #[test]
    fn test_unknown_code_falls_back_to_generic() {
        let err = CoreError::validation("some_future_code", "x");
        let rendered = humanize(&err, Register::Plain);
        assert!(rendered.text.contains("inesperado"));
        assert_eq!(rendered.severity, Severity::Error);
    }

    #[test]
    fn test_internal_details_never_leak() {
        let err = CoreError::Internal("stack trace with secrets".into());
        let rendered = humanize(&err, Register::Decorated);
        assert!(!rendered.text.contains("secrets"));
    }

    #[test]
    fn test_every_entry_has_valid_tokens() {
        for entry in CATALOG.values() {
            for (_, token) in entry.recovery_actions {
                assert!(
                    crate::router::callbacks::CallbackToken::parse(token).is_ok(),
                    "catalog token '{token}' must parse"
                );
            }
        }
    }
}
