//! Prompt assembly for the generation step.
//!
//! The instructions, the conversation so far and the retrieved passages are
//! folded into one user message, the way the chat model was tuned against.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::models::Message;
use crate::rag::Passage;
use crate::session::{Role, Turn};

pub const ASSISTANT_NAME: &str = "Alim";

pub const NO_ANSWER_FALLBACK: &str = "Désolé, je n'ai pas pu générer de réponse.";

const SYSTEM_INSTRUCTION: &str = "\
Votre nom est Alim. Votre rôle est de fournir des réponses claires, précises et authentiques concernant la connaissance islamique.
Vous êtes un assistant expert en Islam et vous vous basez strictement sur les sources de connaissances qui vous sont fournies.

**Mission :**
Faciliter l'accès à la connaissance islamique en servant de pont entre l'utilisateur et les sources authentiques (Coran, Hadiths, Sunnah du Prophète Muhammad - paix et bénédiction soient sur lui - et la Sharî'a).

**Tâches :**
1. Répondre aux questions en vous basant EXCLUSIVEMENT sur le CONTEXTE fourni.
2. Maintenir la cohérence de la conversation en tenant compte de l'HISTORIQUE.

**Ce que vous ne devez JAMAIS faire :**
* Donner votre propre opinion ou un raisonnement personnel.
* Inventer des informations ou des réponses.
* Chercher des informations en dehors des sources fournies.
* Spéculer sur des sujets que le contexte ne traite pas explicitement.
* Répondre à des questions qui ne sont pas liées à l'Islam.

**Ce que vous devez TOUJOURS faire :**
* Répondre en français ou dans la langue de l'utilisateur.
* Citer la source (Coran, Hadith, Sunnah) lorsque le contexte le permet.
* Dire \"L'information n'est pas disponible dans mes sources actuelles\" si la réponse n'est pas clairement présente dans le CONTEXTE.
* Adopter un ton respectueux, informatif et humble.
* Privilégier la clarté et la concision.

**Méthodologie :**
1. Comprendre la question de l'utilisateur.
2. Chercher la réponse directement et strictement dans le CONTEXTE PERTINENT.
3. Tenir compte de l'HISTORIQUE DE LA CONVERSATION pour suivre le fil de la discussion.
4. Formuler la réponse :
   * Si la réponse est dans le CONTEXTE, répondre uniquement à partir de ce contexte.
   * Sinon, répondre : \"Je ne suis pas en mesure de répondre à cette question basée sur les informations dont je dispose actuellement. Veuillez reformuler votre question ou consulter une autre source fiable.\"
   * Si la question est hors sujet, rappeler poliment que votre rôle est de répondre aux questions islamiques uniquement.

--- Fin des instructions ---";

static TOKENIZER: Lazy<Option<CoreBPE>> = Lazy::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        tracing::warn!("Tokenizer unavailable, falling back to character estimate: {}", e);
        None
    }
});

pub fn count_tokens(text: &str) -> usize {
    match TOKENIZER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    history_token_budget: usize,
}

impl PromptBuilder {
    pub fn new(history_token_budget: usize) -> Self {
        Self { history_token_budget }
    }

    pub fn build(&self, question: &str, context: &[Passage], history: &[Turn]) -> Vec<Message> {
        let history = trim_history(history, self.history_token_budget);
        let prompt = format!(
            "{instructions}\n\n\
             Voici l'historique de la conversation:\n{history}\n\n\
             Voici le contexte pertinent:\n{context}\n\n\
             Question de l'utilisateur: {question}\n\n\
             Votre réponse basée sur les instructions ci-dessus :",
            instructions = SYSTEM_INSTRUCTION,
            history = format_history(history),
            context = format_context(context),
            question = question,
        );
        vec![Message::user(prompt)]
    }
}

pub fn format_history(history: &[Turn]) -> String {
    history
        .iter()
        .map(|turn| match turn.role {
            Role::Human => format!("Utilisateur: {}", turn.content),
            Role::Ai => format!("{}: {}", ASSISTANT_NAME, turn.content),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_context(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| {
            let citation = match (p.source.is_empty(), &p.reference) {
                (true, None) => return p.text.clone(),
                (true, Some(reference)) => reference.clone(),
                (false, None) => p.source.clone(),
                (false, Some(reference)) => format!("{}, {}", p.source, reference),
            };
            format!("{}\n(Source: {})", p.text, citation)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Most recent suffix of `history` whose rendering fits in `budget` tokens.
pub fn trim_history(history: &[Turn], budget: usize) -> &[Turn] {
    let mut used = 0;
    let mut start = history.len();
    for (i, turn) in history.iter().enumerate().rev() {
        let cost = count_tokens(&turn.content) + 4;
        if used + cost > budget {
            break;
        }
        used += cost;
        start = i;
    }
    if start > 0 {
        tracing::debug!("Dropped {} old turns to fit the history budget", start);
    }
    &history[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(text: &str, source: &str, reference: Option<&str>) -> Passage {
        Passage {
            text: text.to_string(),
            source: source.to_string(),
            reference: reference.map(str::to_string),
            chunk_index: 0,
            score: 0.9,
        }
    }

    #[test]
    fn test_history_rendering() {
        let history = vec![Turn::human("Qui est Abu Bakr ?"), Turn::ai("Le premier calife.")];
        assert_eq!(
            format_history(&history),
            "Utilisateur: Qui est Abu Bakr ?\nAlim: Le premier calife."
        );
    }

    #[test]
    fn test_context_citations() {
        let passages = vec![
            passage("La prière est un pilier.", "piliers.txt", None),
            passage("Les actes ne valent que par les intentions.", "hadiths.jsonl", Some("Bukhari 1")),
            passage("Texte sans source.", "", None),
        ];
        let context = format_context(&passages);
        assert!(context.contains("La prière est un pilier.\n(Source: piliers.txt)"));
        assert!(context.contains("(Source: hadiths.jsonl, Bukhari 1)"));
        assert!(context.ends_with("\n\nTexte sans source."));
    }

    #[test]
    fn test_build_single_user_message() {
        let builder = PromptBuilder::new(1000);
        let messages = builder.build(
            "Combien de prières par jour ?",
            &[passage("Cinq prières quotidiennes.", "fiqh.txt", None)],
            &[Turn::human("Salam"), Turn::ai("Wa alaykum salam")],
        );

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
        let prompt = &messages[0].content;
        assert!(prompt.starts_with("Votre nom est Alim."));
        assert!(prompt.contains("Utilisateur: Salam\nAlim: Wa alaykum salam"));
        assert!(prompt.contains("Cinq prières quotidiennes."));
        assert!(prompt.contains("Question de l'utilisateur: Combien de prières par jour ?"));
    }

    #[test]
    fn test_empty_context_and_history() {
        let messages = PromptBuilder::new(1000).build("Question ?", &[], &[]);
        assert!(messages[0].content.contains("Voici le contexte pertinent:\n\n"));
    }

    #[test]
    fn test_trim_history_keeps_most_recent() {
        let history: Vec<Turn> = (0..20)
            .map(|i| Turn::human(format!("message numéro {} {}", i, "mot ".repeat(20))))
            .collect();
        let trimmed = trim_history(&history, 100);
        assert!(!trimmed.is_empty());
        assert!(trimmed.len() < history.len());
        assert_eq!(trimmed.last(), history.last());

        assert!(trim_history(&history, 0).is_empty());
        assert_eq!(trim_history(&history, usize::MAX / 2).len(), 20);
    }
}
