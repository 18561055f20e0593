use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const PROMPT_DELIMITER: &str = "||PROMPT||";
pub const CHAPTER_DELIMITER: &str = "||CAPITULO||";
const PREVIOUS_PREVIEW_CHARS: usize = 200;

pub const SCRIPT_SYSTEM: &str = "Eres un guionista profesional. Responde solo con el texto que se narrará, sin títulos, notas ni comentarios.";
pub const PROMPTS_SYSTEM: &str = "Eres un experto en arte conceptual y narrativa visual. Tu única tarea es crear prompts separados por \"||PROMPT||\", sin texto adicional.";
pub const CHAPTERS_SYSTEM: &str = "Eres un experto en estructura narrativa. Tu única tarea es crear títulos de capítulos separados por \"||CAPITULO||\", sin texto adicional.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStyle {
    #[default]
    Professional,
    Comedy,
    Custom,
}

/// Everything a section prompt depends on.
#[derive(Debug, Clone, Copy)]
pub struct SectionContext<'a> {
    pub topic: &'a str,
    pub sections: u32,
    pub section: u32,
    pub chapters: &'a [String],
    /// Scripts already written, keyed by section number.
    pub previous: &'a [(u32, String)],
    pub custom_instructions: Option<&'a str>,
}

impl SectionContext<'_> {
    fn is_first(&self) -> bool {
        self.section <= 1
    }

    fn is_last(&self) -> bool {
        self.section >= self.sections
    }

    fn chapter_title(&self, section: u32) -> String {
        section
            .checked_sub(1)
            .and_then(|i| self.chapters.get(i as usize))
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| format!("Capítulo {section}"))
    }

    fn chapter_block(&self) -> String {
        if self.chapters.is_empty() {
            return String::new();
        }
        let list: Vec<String> = self
            .chapters
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}. {}", i + 1, t.trim()))
            .collect();
        format!(
            "\n\nESTRUCTURA COMPLETA DE CAPÍTULOS:\n{}\n\nCAPÍTULO ACTUAL: {}",
            list.join("\n"),
            self.chapter_title(self.section)
        )
    }

    fn previous_block(&self) -> String {
        if self.previous.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = self
            .previous
            .iter()
            .map(|(section, text)| {
                let preview = crate::api::truncate_chars(text, PREVIOUS_PREVIEW_CHARS);
                format!("{}:\n{}", self.chapter_title(*section), preview)
            })
            .collect();
        format!(
            "\n\nCONTEXTO DE CAPÍTULOS ANTERIORES:\n{}\n\nMantén la continuidad narrativa con lo ya contado.",
            parts.join("\n\n")
        )
    }

    fn focus_line(&self) -> String {
        if self.chapters.is_empty() {
            return String::new();
        }
        format!(
            "\n- Enfócate en el contenido del capítulo {}: \"{}\"",
            self.section,
            self.chapter_title(self.section)
        )
    }
}

const LENGTH_RULES: &str = "- Exactamente 3 párrafos\n- Entre 250 y 300 palabras";

const OUTPUT_RULES: &str = "FORMATO DE RESPUESTA:\n\
- Responde únicamente con el texto del guión, listo para TTS\n\
- Sin etiquetas como \"Capítulo 1:\" o \"Guión:\"\n\
- Sin notas, aclaraciones ni comentarios";

fn closing_rule(ctx: &SectionContext<'_>, farewell: &str) -> String {
    if ctx.is_last() {
        format!(
            "Este es el último capítulo ({}/{}): termina con {farewell} que invite a comentar, dar like, suscribirse y sugerir temas.",
            ctx.section, ctx.sections
        )
    } else {
        "No incluyas despedida; vienen más capítulos.".to_string()
    }
}

/// Prompt for one section of the script in the chosen style.
pub fn script_prompt(style: ScriptStyle, ctx: &SectionContext<'_>) -> String {
    match style {
        ScriptStyle::Professional => professional(ctx),
        ScriptStyle::Comedy => comedy(ctx),
        ScriptStyle::Custom => match ctx.custom_instructions.map(str::trim) {
            Some(instructions) if !instructions.is_empty() => custom(ctx, instructions),
            _ => professional(ctx),
        },
    }
}

fn opening(ctx: &SectionContext<'_>, role: &str) -> String {
    if ctx.is_first() {
        format!(
            "{role}\n\nTEMA: \"{}\"\nTOTAL DE CAPÍTULOS: {}{}\n\nDame solo el capítulo 1 de {}. Da la bienvenida al canal y presenta el tema de forma atractiva.",
            ctx.topic,
            ctx.sections,
            ctx.chapter_block(),
            ctx.sections
        )
    } else {
        format!(
            "Ahora dame el capítulo {} de {} del mismo tema: \"{}\".{}{}",
            ctx.section,
            ctx.sections,
            ctx.topic,
            ctx.chapter_block(),
            ctx.previous_block()
        )
    }
}

fn professional(ctx: &SectionContext<'_>) -> String {
    format!(
        "{}\n\nESTRUCTURA DEL CAPÍTULO {}:\n{LENGTH_RULES}\n- Tono profesional y enganchante\n- Adapta el enfoque al tipo de tema: narrativo para ficción, factual para historia, práctico para procesos{}\n\n{OUTPUT_RULES}\n\n{}",
        opening(ctx, "Eres un escritor profesional especializado en guiones para YouTube."),
        ctx.section,
        ctx.focus_line(),
        closing_rule(ctx, "una despedida profesional")
    )
}

fn comedy(ctx: &SectionContext<'_>) -> String {
    format!(
        "{}\n\nESTILO: sarcástico, irónico, humor negro y absurdo, lenguaje coloquial mexicano con groserías. \
         Se lee como una actuación con varias voces entre corchetes, por ejemplo [voz de narrador serio], [voz sarcástica], [grito desesperado]. \
         Prohibido usar la palabra \"show\" y hacer chistes sobre políticos o ex parejas.\n\n\
         ESTRUCTURA DEL CAPÍTULO {}:\n{LENGTH_RULES}\n- Al menos 4 voces distintas por párrafo, con efectos sonoros ridículos{}\n\n{OUTPUT_RULES}\n\n{}",
        opening(ctx, "Eres un escritor de guiones creativo para contenido de YouTube."),
        ctx.section,
        ctx.focus_line(),
        closing_rule(ctx, "una despedida cómica")
    )
}

fn custom(ctx: &SectionContext<'_>, instructions: &str) -> String {
    format!(
        "{}\n\nINSTRUCCIONES DE ESTILO DEL USUARIO:\n{instructions}\n\nESTRUCTURA DEL CAPÍTULO {}:\n{LENGTH_RULES}\n- Aplica el estilo indicado de forma consistente{}\n\n{OUTPUT_RULES}\n\n{}",
        opening(ctx, "Eres un escritor de guiones para YouTube que sigue un estilo definido por el usuario."),
        ctx.section,
        ctx.focus_line(),
        closing_rule(ctx, "una despedida acorde al estilo")
    )
}

pub fn chapter_prompt(topic: &str, sections: u32) -> String {
    format!(
        "Crea la estructura de un guión de YouTube sobre \"{topic}\" con exactamente {sections} capítulos \
         en progresión narrativa lógica, con títulos que generen curiosidad.\n\n\
         Responde solo con los títulos separados por \"{CHAPTER_DELIMITER}\" ({} delimitadores en total).",
        sections.saturating_sub(1)
    )
}

pub fn image_prompts_request(script: &str, count: u32) -> String {
    format!(
        "Basándote en este guión, crea exactamente {count} prompts visuales en inglés, \
         en orden cronológico, separados por \"{PROMPT_DELIMITER}\".\n\nGUIÓN:\n{script}"
    )
}

/// Prompt asking for YouTube titles, description, tags and thumbnail ideas
/// for a finished project.
pub fn metadata_prompt(topic: &str, full_script: &str) -> String {
    format!(
        "Basándote en el tema y el guión completo, genera metadata optimizada para YouTube.\n\n\
         TEMA: {topic}\n\nGUIÓN COMPLETO:\n{full_script}\n\n\
         Genera:\n\
         1. 10 títulos llamativos numerados, de 10 a 15 palabras, relacionados con el contenido\n\
         2. Una descripción SEO de 150 a 300 palabras con llamada a suscribirse y emojis\n\
         3. 25 etiquetas separadas por comas, sin espacios en etiquetas compuestas\n\
         4. 5 prompts numerados para miniaturas 16:9, cada uno con una descripción visual detallada \
         y una frase llamativa entre comillas superpuesta"
    )
}

fn split_delimited(text: &str, delimiter: &str, limit: usize) -> Vec<String> {
    text.split(delimiter)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .take(limit)
        .map(str::to_string)
        .collect()
}

/// Split the model's delimited prompt list, dropping blanks, keeping at most `limit`.
pub fn split_image_prompts(text: &str, limit: usize) -> Vec<String> {
    split_delimited(text, PROMPT_DELIMITER, limit)
}

pub fn split_chapters(text: &str, sections: u32) -> Vec<String> {
    split_delimited(text, CHAPTER_DELIMITER, sections as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(section: u32, chapters: &'a [String], previous: &'a [(u32, String)]) -> SectionContext<'a> {
        SectionContext {
            topic: "La caída de Roma",
            sections: 3,
            section,
            chapters,
            previous,
            custom_instructions: None,
        }
    }

    #[test]
    fn first_section_welcomes_and_lists_chapters() {
        let chapters = vec!["El origen".to_string(), "El declive".to_string(), "El final".to_string()];
        let prompt = script_prompt(ScriptStyle::Professional, &ctx(1, &chapters, &[]));
        assert!(prompt.contains("bienvenida"));
        assert!(prompt.contains("1. El origen\n2. El declive"));
        assert!(prompt.contains("CAPÍTULO ACTUAL: El origen"));
        assert!(prompt.contains("No incluyas despedida"));
    }

    #[test]
    fn last_section_carries_context_and_farewell() {
        let previous = vec![(1, "Roma nació junto al Tíber.".to_string()), (2, "x".repeat(400))];
        let prompt = script_prompt(ScriptStyle::Comedy, &ctx(3, &[], &previous));
        assert!(prompt.contains("capítulo 3 de 3"));
        assert!(prompt.contains("Capítulo 1:\nRoma nació junto al Tíber."));
        assert!(prompt.contains(&format!("{}...", "x".repeat(200))));
        assert!(prompt.contains("despedida cómica"));
        assert!(prompt.contains("[voz sarcástica]"));
    }

    #[test]
    fn custom_style_needs_instructions() {
        let mut with = ctx(2, &[], &[]);
        with.custom_instructions = Some("Narra como un documental de naturaleza");
        let prompt = script_prompt(ScriptStyle::Custom, &with);
        assert!(prompt.contains("Narra como un documental de naturaleza"));

        let without = script_prompt(ScriptStyle::Custom, &ctx(2, &[], &[]));
        assert_eq!(without, script_prompt(ScriptStyle::Professional, &ctx(2, &[], &[])));
    }

    #[test]
    fn splits_delimited_lists() {
        let text = "A dark forest||PROMPT||An epic battle||PROMPT|| ||PROMPT||A ruined castle";
        assert_eq!(
            split_image_prompts(text, 5),
            vec!["A dark forest", "An epic battle", "A ruined castle"]
        );
        assert_eq!(split_image_prompts(text, 1), vec!["A dark forest"]);

        let chapters = "Capítulo 1: Inicio||CAPITULO||Capítulo 2: Nudo||CAPITULO||Capítulo 3: Fin||CAPITULO||Extra";
        assert_eq!(split_chapters(chapters, 3).len(), 3);
        assert!(chapter_prompt("Roma", 3).contains("2 delimitadores"));
    }
}
