//! Titles, narration scripts and voice-over for the products of one keyword.

use crate::api::gemini::Gemini;
use crate::api::tts::synthesize_to_wav;
use crate::config::Config;
use crate::error::{PipelineError, is_fatal};
use crate::init::Workspace;
use crate::model::{ENHANCED_PRODUCTS_FILE, EnhancedProduct, EnhancedProducts, PRODUCTS_FILE, Product, load_products};
use crate::{logi, logok, logw};
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use regex::Regex;
use std::path::{Path, PathBuf};

const MAX_TITLE_WORDS: usize = 5;
const MAX_SPOKEN_WORDS: usize = 3;

const DEFAULT_TITLE_PROMPT: &str = "Rewrite this product title for a YouTube video overlay.\n\
Product title: {product_title}\n\
Details: {description_text}\n\n\
Answer with exactly two lines:\n\
DISPLAY TITLE: <brand and model, at most 5 words>\n\
SPOKEN NAME: <what a presenter would say, at most 3 words>";

const DEFAULT_SCRIPT_PROMPT: &str = "Write a 30 to 40 second voice-over for product number {position} \
in a countdown video about the best {keyword}. The previous product was {previous_spoken_name}. \
Call this product {spoken_name}. Product: {current_product_title}. Details: {current_product_description}. \
Plain spoken text only, no headings, no emojis, no markdown.";

const DEFAULT_OUTRO_PROMPT: &str = "Write a two sentence closing line for a video about the best {keyword}. \
Recommend {top_choice_name} as the best overall choice and invite viewers to check the links below. \
Plain spoken text only.";

/// Countdown position spelled out for the narration language. Unknown
/// languages and positions fall back to digits.
pub fn number_word(position: u32, language: &str) -> String {
    let words: &[&str] = match language {
        "de" => &["eins", "zwei", "drei", "vier", "fünf"],
        "en" => &["one", "two", "three", "four", "five"],
        "es" => &["uno", "dos", "tres", "cuatro", "cinco"],
        "fr" => &["un", "deux", "trois", "quatre", "cinq"],
        "it" => &["uno", "due", "tre", "quattro", "cinque"],
        "nl" => &["een", "twee", "drie", "vier", "vijf"],
        "pl" => &["jeden", "dwa", "trzy", "cztery", "pięć"],
        "sv" => &["ett", "två", "tre", "fyra", "fem"],
        _ => &[],
    };
    position
        .checked_sub(1)
        .and_then(|i| words.get(i as usize))
        .map(|w| w.to_string())
        .unwrap_or_else(|| position.to_string())
}

/// Teaser appended to the second-to-last product before the winner.
pub fn position_two_cta(language: &str) -> &'static str {
    match language {
        "fr" => "Avant de passer au numéro un : les produits présentés partent vite et peuvent être en rupture. Cliquez sur les liens sous la vidéo pour vérifier la disponibilité et, si c’est dispo, ajoutez‑le au panier pour le garder de côté.",
        "es" => "Antes de revelar el número uno: los productos presentados suelen agotarse rápido. Revisa los enlaces debajo del vídeo para ver la disponibilidad actual y, si está disponible, añádelo al carrito para reservarlo.",
        "de" => "Bevor wir die Nummer eins zeigen: Die vorgestellten Produkte sind oft schnell ausverkauft. Prüfe die Links unter dem Video für die aktuelle Verfügbarkeit und lege den Artikel, falls verfügbar, in den Warenkorb, um ihn zu sichern.",
        "it" => "Prima di svelare il numero uno: i prodotti presentati si esauriscono spesso in fretta. Controlla i link sotto al video per la disponibilità aggiornata e, se è disponibile, aggiungilo al carrello per tenerlo da parte.",
        "nl" => "Voordat we nummer één onthullen: de getoonde producten raken vaak snel uitverkocht. Check de links onder de video voor de actuele beschikbaarheid en voeg het, als het beschikbaar is, toe aan je winkelwagen om het te bewaren.",
        "pl" => "Zanim przejdziemy do numeru jeden: prezentowane produkty często szybko się wyprzedają. Sprawdź linki pod filmem, a jeśli produkt jest dostępny, dodaj go do koszyka, aby go zachować.",
        "sv" => "Innan vi avslöjar nummer ett: produkterna vi visar tar ofta slut snabbt. Kolla länkarna under videon för aktuell tillgänglighet och lägg den i varukorgen om den finns i lager för att spara den.",
        _ => "Before we reveal number one: featured items often sell out fast. Check the links below for current availability and, if it's in stock, add it to your cart to hold it.",
    }
}

fn cached(cell: &'static OnceCell<Regex>, pattern: &str) -> Result<&'static Regex> {
    Ok(cell.get_or_try_init(|| Regex::new(pattern))?)
}

/// Strips markdown and symbols a voice model would read out loud.
pub fn clean_text_for_tts(text: &str) -> Result<String> {
    static BOLD: OnceCell<Regex> = OnceCell::new();
    static ITALIC: OnceCell<Regex> = OnceCell::new();
    static UNDERLINE: OnceCell<Regex> = OnceCell::new();
    static UNDERSCORE: OnceCell<Regex> = OnceCell::new();
    static SYMBOLS: OnceCell<Regex> = OnceCell::new();
    static SPACES: OnceCell<Regex> = OnceCell::new();
    static BEFORE_PUNCT: OnceCell<Regex> = OnceCell::new();

    let text = text.replace('\\', "");
    let text = cached(&BOLD, r"\*\*(.*?)\*\*")?.replace_all(&text, "$1");
    let text = cached(&ITALIC, r"\*(.*?)\*")?.replace_all(&text, "$1");
    let text = cached(&UNDERLINE, r"__(.*?)__")?.replace_all(&text, "$1");
    let text = cached(&UNDERSCORE, r"_(.*?)_")?.replace_all(&text, "$1");
    let text = cached(&SYMBOLS, r"[^\w\s.!?,:;()\-']")?.replace_all(&text, "");
    let text = cached(&SPACES, r"\s+")?.replace_all(&text, " ");
    let text = cached(&BEFORE_PUNCT, r"\s+([.!?,:;])")?.replace_all(&text, "$1");
    Ok(text.trim().to_string())
}

/// Drops a leading "top 3 ..." sentence from every segment but the opener.
pub fn strip_top3_intro(text: &str, position: u32) -> Result<String> {
    static INTRO: OnceCell<Regex> = OnceCell::new();
    if text.is_empty() || position == 3 {
        return Ok(text.to_string());
    }
    let cleaned = cached(&INTRO, r"(?is)^\s*[^.]*\btop\s*3\b[^.]*\.\s*")?.replace(text, "");
    Ok(cleaned.trim().to_string())
}

fn truncate_words(text: &str, max: usize) -> String {
    text.split_whitespace().take(max).collect::<Vec<_>>().join(" ")
}

/// Reads `LABEL value` lines out of a title rewrite reply. Missing labels
/// fall back to the original title and its first word.
pub fn parse_title_reply(reply: &str, display_label: &str, spoken_label: &str, original: &str) -> Result<(String, String)> {
    let find = |label: &str| -> Result<Option<String>> {
        let re = Regex::new(&format!(r"(?im)^{}[ \t]*(.*)$", regex::escape(label)))?;
        Ok(re
            .captures(reply)
            .map(|c| c[1].trim().to_string())
            .filter(|v| !v.is_empty()))
    };

    let short_title = find(display_label)?.unwrap_or_else(|| original.to_string());
    let spoken_name = find(spoken_label)?.unwrap_or_else(|| {
        short_title
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string()
    });

    Ok((
        truncate_words(&short_title, MAX_TITLE_WORDS),
        truncate_words(&spoken_name, MAX_SPOKEN_WORDS),
    ))
}

/// Titles used when the rewrite call fails: the original title, spoken by
/// its first word.
fn original_titles(display_label: &str, spoken_label: &str, original: &str) -> Result<(String, String)> {
    parse_title_reply("", display_label, spoken_label, original)
}

/// `{name}` placeholder substitution. `{{` and `}}` become literal braces.
pub fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out.replace("{{", "{").replace("}}", "}")
}

/// Products ordered by scrape index with countdown positions: the first
/// scraped product opens the video with the highest number.
pub fn assign_positions(mut products: Vec<Product>) -> Vec<(u32, Product)> {
    products.sort_by_key(|p| p.index);
    let total = products.len() as u32;
    products
        .into_iter()
        .enumerate()
        .map(|(i, p)| (total - i as u32, p))
        .collect()
}

pub struct ContentGenerator {
    cfg: Config,
    ws: Workspace,
    gemini: Gemini,
}

impl ContentGenerator {
    pub fn new(cfg: Config, ws: Workspace, gemini: Gemini) -> Self {
        Self { cfg, ws, gemini }
    }

    async fn prompt_template(&self, kind: &str, fallback: &str) -> String {
        let path = self.ws.prompt_file(kind, &self.cfg.language);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(_) => {
                logw(format!("Prompt {} not found, using built-in template", path.display()));
                fallback.to_string()
            }
        }
    }

    async fn rewrite_title(&self, template: &str, product: &Product) -> Result<(String, String)> {
        let description = product.description.join(" ");
        let prompt = fill_template(
            template,
            &[("product_title", product.title.as_str()), ("description_text", description.as_str())],
        );

        match self.gemini.generate_text(&self.cfg.gemini.text_model, &prompt).await {
            Ok(reply) => {
                let (short, spoken) = parse_title_reply(
                    &reply,
                    &self.cfg.labels.display_title,
                    &self.cfg.labels.spoken_name,
                    &product.title,
                )?;
                logok(format!("Titles: '{}' / '{}'", short, spoken));
                Ok((short, spoken))
            }
            Err(err) if is_fatal(&err) => Err(err),
            Err(err) => {
                logw(format!("Title rewrite failed, keeping original: {:#}", err));
                original_titles(&self.cfg.labels.display_title, &self.cfg.labels.spoken_name, &product.title)
            }
        }
    }

    async fn product_script(
        &self,
        template: &str,
        keyword: &str,
        current: &EnhancedProduct,
        previous: Option<&EnhancedProduct>,
    ) -> Result<String> {
        let position = number_word(current.position, &self.cfg.language);
        let description = current.product.description.join(" ");
        let previous_name = previous.map(|p| p.spoken_name.as_str()).unwrap_or_default();
        let prompt = fill_template(
            template,
            &[
                ("position", position.as_str()),
                ("previous_spoken_name", previous_name),
                ("keyword", keyword),
                ("spoken_name", current.spoken_name.as_str()),
                ("current_product_title", current.product.title.as_str()),
                ("current_product_description", description.as_str()),
            ],
        );

        let raw = self
            .gemini
            .generate_text(&self.cfg.gemini.text_model, &prompt)
            .await
            .with_context(|| format!("script generation failed for product #{}", current.position))?;

        let mut script = strip_top3_intro(&clean_text_for_tts(&raw)?, current.position)?;
        if current.position == 2 {
            script = format!("{} {}", script, position_two_cta(&self.cfg.language))
                .trim()
                .to_string();
        }
        logok(format!("Script ready for product #{}", current.position));
        Ok(script)
    }

    async fn hero_outro(&self, keyword: &str, top: &EnhancedProduct) -> Result<Option<String>> {
        let template = self.prompt_template("outro", DEFAULT_OUTRO_PROMPT).await;
        let name = if top.spoken_name.is_empty() {
            top.short_title.as_str()
        } else {
            top.spoken_name.as_str()
        };
        let prompt = fill_template(&template, &[("keyword", keyword), ("top_choice_name", name)]);

        match self.gemini.generate_text(&self.cfg.gemini.outro_model, &prompt).await {
            Ok(reply) => Ok(Some(clean_text_for_tts(&reply)?)),
            Err(err) if is_fatal(&err) => Err(err),
            Err(err) => {
                logw(format!("Outro generation failed, skipping it: {:#}", err));
                Ok(None)
            }
        }
    }

    async fn narrate(&self, product: &EnhancedProduct, audio_dir: &Path) -> Result<PathBuf> {
        let out = audio_dir.join(format!("product_{}_audio.wav", product.position));
        synthesize_to_wav(
            &self.gemini,
            &self.cfg.gemini.tts_model,
            self.cfg.gemini.voice_for(product.position),
            &self.cfg.gemini.tts_prompt,
            &product.script,
            &out,
        )
        .await
    }

    /// Reads `product.json` from `output_dir` and writes
    /// `enhanced_product.json` next to it. `preview` skips narration audio.
    pub async fn generate(&self, keyword: &str, output_dir: &Path, audio_dir: &Path, preview: bool) -> Result<PathBuf> {
        let scraped = output_dir.join(PRODUCTS_FILE);
        if !scraped.exists() {
            return Err(PipelineError::MissingInput(scraped).into());
        }
        let products = load_products(&scraped).await?;
        logi(format!("Loaded {} products for '{}'", products.len(), keyword));

        let title_template = self.prompt_template("short_title", DEFAULT_TITLE_PROMPT).await;
        let ordered = assign_positions(products);
        let titles = futures::future::try_join_all(
            ordered
                .iter()
                .map(|(_, p)| self.rewrite_title(&title_template, p)),
        )
        .await?;

        let mut enhanced: Vec<EnhancedProduct> = ordered
            .into_iter()
            .zip(titles)
            .map(|((position, product), (short_title, spoken_name))| EnhancedProduct {
                product,
                position,
                short_title,
                spoken_name,
                script: String::new(),
                final_audio_file: None,
                segment_duration: None,
            })
            .collect();

        let script_template = self.prompt_template("script", DEFAULT_SCRIPT_PROMPT).await;
        let scripts = futures::future::try_join_all(enhanced.iter().enumerate().map(|(i, p)| {
            let previous = i.checked_sub(1).and_then(|j| enhanced.get(j));
            self.product_script(&script_template, keyword, p, previous)
        }))
        .await?;
        for (product, script) in enhanced.iter_mut().zip(scripts) {
            product.script = script;
        }

        let top_index = enhanced.iter().position(|p| p.position == 1);
        if let Some(i) = top_index {
            if let Some(outro) = self.hero_outro(keyword, &enhanced[i]).await? {
                let top = &mut enhanced[i];
                top.script = format!("{} {}", top.script, outro).trim().to_string();
                logok("Outro appended to product #1");
            }
        }

        if preview {
            logi("Preview mode: skipping narration audio");
        } else {
            let files = futures::future::try_join_all(enhanced.iter().map(|p| self.narrate(p, audio_dir))).await?;
            for (product, file) in enhanced.iter_mut().zip(files) {
                product.final_audio_file = Some(file);
            }
        }

        let out = output_dir.join(ENHANCED_PRODUCTS_FILE);
        EnhancedProducts {
            keyword: keyword.to_string(),
            products: enhanced,
        }
        .save(&out)
        .await?;
        logok(format!("Content saved to {}", out.display()));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    #[test]
    fn failed_rewrite_speaks_the_first_word() {
        let (short, spoken) =
            original_titles("DISPLAY TITLE:", "SPOKEN NAME:", "Logitech MX Master 3S Wireless Mouse Graphite Edition").unwrap();
        assert_eq!(short, "Logitech MX Master 3S Wireless");
        assert_eq!(spoken, "Logitech");
    }

    #[test]
    fn numbers_in_each_language() {
        assert_eq!(number_word(3, "en"), "three");
        assert_eq!(number_word(1, "fr"), "un");
        assert_eq!(number_word(5, "pl"), "pięć");
        assert_eq!(number_word(2, "ja"), "2");
        assert_eq!(number_word(7, "de"), "7");
        assert_eq!(number_word(0, "en"), "0");
    }

    #[test]
    fn tts_cleanup_removes_markdown_and_symbols() {
        let raw = "**Meet** the *MX Master*  — it's __fast__ & _quiet_ !\\ Only $99 🔥 .";
        assert_eq!(
            clean_text_for_tts(raw).unwrap(),
            "Meet the MX Master it's fast quiet! Only 99."
        );
        assert_eq!(clean_text_for_tts("Très élégant, non ?").unwrap(), "Très élégant, non?");
    }

    #[test]
    fn top3_intro_only_kept_for_opener() {
        let text = "Welcome to our top 3 wireless mice. Number two is quiet.";
        assert_eq!(strip_top3_intro(text, 2).unwrap(), "Number two is quiet.");
        assert_eq!(strip_top3_intro(text, 3).unwrap(), text);
        assert_eq!(strip_top3_intro("Number one rocks.", 1).unwrap(), "Number one rocks.");
    }

    #[test]
    fn title_reply_labels() {
        let reply = "display title: Logitech MX Master 3S Wireless Mouse Edition\nSPOKEN NAME: the MX Master three";
        let (short, spoken) = parse_title_reply(reply, "DISPLAY TITLE:", "SPOKEN NAME:", "orig").unwrap();
        assert_eq!(short, "Logitech MX Master 3S Wireless");
        assert_eq!(spoken, "the MX Master");

        let (short, spoken) = parse_title_reply("no labels", "DISPLAY TITLE:", "SPOKEN NAME:", "Razer Basilisk V3").unwrap();
        assert_eq!(short, "Razer Basilisk V3");
        assert_eq!(spoken, "Razer");
    }

    #[test]
    fn templates_fill_named_placeholders() {
        let out = fill_template(
            "Top {position} for {keyword}: {{literal}} {unknown}",
            &[("position", "three"), ("keyword", "mice")],
        );
        assert_eq!(out, "Top three for mice: {literal} {unknown}");
    }

    #[test]
    fn first_scraped_gets_highest_position() {
        let products = vec![
            fixtures::product(2, "Beta"),
            fixtures::product(1, "Alpha"),
            fixtures::product(3, "Gamma"),
        ];
        let ordered: Vec<(u32, String)> = assign_positions(products)
            .into_iter()
            .map(|(pos, p)| (pos, p.title))
            .collect();
        assert_eq!(
            ordered,
            vec![(3, "Alpha".to_string()), (2, "Beta".to_string()), (1, "Gamma".to_string())]
        );
    }

    #[test]
    fn cta_defaults_to_english() {
        assert!(position_two_cta("xx").starts_with("Before we reveal number one"));
        assert!(position_two_cta("de").starts_with("Bevor"));
    }
}
