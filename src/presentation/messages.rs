//! Externalized message catalog with two registers.
//!
//! The decorated register carries glyphs for scannability; the plain
//! register is the same content without decoration. Both are always
//! semantically complete. Placeholders use `{name}` and are filled by
//! [`render`].

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Text register selected by `UiPreferences.simplified_ui`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Decorated,
    Plain,
}

impl Register {
    pub fn from_simplified(simplified_ui: bool) -> Self {
        if simplified_ui {
            Register::Plain
        } else {
            Register::Decorated
        }
    }
}

struct Template {
    decorated: &'static str,
    plain: &'static str,
}

static CATALOG: Lazy<HashMap<&'static str, Template>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "welcome",
        Template {
            decorated: "🎙️ Olá! Envie uma mensagem de voz para começar uma sessão, ou use os botões abaixo.",
            plain: "Olá! Envie uma mensagem de voz para começar uma sessão, ou use os botões abaixo.",
        },
    );
    m.insert(
        "session_started",
        Template {
            decorated: "🆕 Sessão <b>{name}</b> aberta. Pode mandar seus áudios.",
            plain: "Sessão {name} aberta. Pode mandar seus áudios.",
        },
    );
    m.insert(
        "audio_received",
        Template {
            decorated: "🎧 Áudio {sequence} recebido ({size}).",
            plain: "Áudio {sequence} recebido ({size}).",
        },
    );
    m.insert(
        "session_finalized",
        Template {
            decorated: "✅ Sessão <b>{name}</b> finalizada. Transcrevendo {count} áudio(s)…",
            plain: "Sessão {name} finalizada. Transcrevendo {count} áudio(s)…",
        },
    );
    m.insert(
        "session_reopened",
        Template {
            decorated: "🔄 Sessão <b>{name}</b> reaberta (ciclo {epoch}). Áudios novos serão adicionados ao final.",
            plain: "Sessão {name} reaberta (ciclo {epoch}). Áudios novos serão adicionados ao final.",
        },
    );
    m.insert(
        "session_ready",
        Template {
            decorated: "📚 Sessão <b>{name}</b> pronta: transcrita e indexada.",
            plain: "Sessão {name} pronta: transcrita e indexada.",
        },
    );
    m.insert(
        "transcription_progress",
        Template {
            decorated: "⏳ {step} — {current}/{total}",
            plain: "{step} — {current}/{total}",
        },
    );
    m.insert(
        "transcription_failed_all",
        Template {
            decorated: "❌ Nenhum áudio da sessão <b>{name}</b> pôde ser transcrito.",
            plain: "Nenhum áudio da sessão {name} pôde ser transcrito.",
        },
    );
    m.insert(
        "search_prompt",
        Template {
            decorated: "🔎 O que você quer encontrar? Responda com o texto da busca.",
            plain: "O que você quer encontrar? Responda com o texto da busca.",
        },
    );
    m.insert(
        "search_cancelled",
        Template {
            decorated: "🕐 A busca expirou sem resposta. Use o menu para tentar de novo.",
            plain: "A busca expirou sem resposta. Use o menu para tentar de novo.",
        },
    );
    m.insert(
        "search_header",
        Template {
            decorated: "🔎 Resultados para <b>{query}</b> ({mode}):",
            plain: "Resultados para {query} ({mode}):",
        },
    );
    m.insert(
        "search_empty",
        Template {
            decorated: "🤷 Nada encontrado. Estas são as sessões mais recentes:",
            plain: "Nada encontrado. Estas são as sessões mais recentes:",
        },
    );
    m.insert(
        "conflict_dialog",
        Template {
            decorated: "⚠️ Já existe a sessão aberta <b>{name}</b> com {count} áudio(s). O que fazer?",
            plain: "Já existe a sessão aberta {name} com {count} áudio(s). O que fazer?",
        },
    );
    m.insert(
        "recovery_prompt",
        Template {
            decorated: "🚨 A sessão <b>{name}</b> ficou aberta quando o sistema parou. Como proceder?",
            plain: "A sessão {name} ficou aberta quando o sistema parou. Como proceder?",
        },
    );
    m.insert(
        "session_discarded",
        Template {
            decorated: "🗑️ Sessão <b>{name}</b> descartada.",
            plain: "Sessão {name} descartada.",
        },
    );
    m.insert(
        "session_resumed",
        Template {
            decorated: "▶️ Sessão <b>{name}</b> retomada. Pode continuar gravando.",
            plain: "Sessão {name} retomada. Pode continuar gravando.",
        },
    );
    m.insert(
        "oracle_thinking",
        Template {
            decorated: "🔮 Consultando o oráculo <b>{name}</b>…",
            plain: "Consultando o oráculo {name}…",
        },
    );
    m.insert(
        "oracle_header",
        Template {
            decorated: "🔮 <b>{name}</b> responde:",
            plain: "{name} responde:",
        },
    );
    m.insert(
        "pref_updated",
        Template {
            decorated: "⚙️ Preferência atualizada: {what}.",
            plain: "Preferência atualizada: {what}.",
        },
    );
    m.insert(
        "retry_scheduled",
        Template {
            decorated: "🔁 {count} segmento(s) voltaram para a fila de transcrição.",
            plain: "{count} segmento(s) voltaram para a fila de transcrição.",
        },
    );
    m.insert(
        "status_line",
        Template {
            decorated: "📊 Sessão <b>{name}</b> — estado {state}, {count} áudio(s), ciclo {epoch}.",
            plain: "Sessão {name} — estado {state}, {count} áudio(s), ciclo {epoch}.",
        },
    );
    m.insert(
        "no_personas",
        Template {
            decorated: "🔮 Nenhum oráculo disponível. Adicione modelos de persona ao diretório configurado.",
            plain: "Nenhum oráculo disponível. Adicione modelos de persona ao diretório configurado.",
        },
    );
    m.insert(
        "conflict_return",
        Template {
            decorated: "👌 Continuando na sessão <b>{name}</b>.",
            plain: "Continuando na sessão {name}.",
        },
    );
    m.insert(
        "text_hint",
        Template {
            decorated: "💬 Recebi seu texto, mas trabalho com áudios. Envie uma mensagem de voz ou use os botões.",
            plain: "Recebi seu texto, mas trabalho com áudios. Envie uma mensagem de voz ou use os botões.",
        },
    );
    m.insert(
        "help",
        Template {
            decorated: "ℹ️ Envie áudios para gravar uma sessão. Finalize para transcrever, busque sessões antigas e consulte oráculos sobre o que foi dito.",
            plain: "Envie áudios para gravar uma sessão. Finalize para transcrever, busque sessões antigas e consulte oráculos sobre o que foi dito.",
        },
    );
    m
});

/// Fixed text for a catalog key.
pub fn text(key: &str, register: Register) -> &'static str {
    let template = CATALOG
        .get(key)
        .unwrap_or_else(|| panic!("unknown message key '{key}'"));
    match register {
        Register::Decorated => template.decorated,
        Register::Plain => template.plain,
    }
}

/// Fill `{name}` placeholders in a catalog template.
pub fn render(key: &str, register: Register, args: &[(&str, String)]) -> String {
    let mut out = text(key, register).to_string();
    for (name, value) in args {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}
