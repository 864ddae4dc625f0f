#![forbid(unsafe_code)]

//! Output naming templates in yt-dlp's `%(field)s` syntax.
//!
//! Supported fields are `id`, `title`, `uploader`, `artist`, `album` and
//! `ext`; unknown or missing fields render as `NA`, `%%` is a literal percent.
//! A `/` written in the template itself creates a sub-directory, while values
//! substituted into it are sanitised so they can never escape the output
//! directory.

use std::path::PathBuf;

use anyhow::{Result, bail};

pub const DEFAULT_TEMPLATE: &str = "%(title)s.%(ext)s";

const MISSING: &str = "NA";
const MAX_COMPONENT_BYTES: usize = 200;

/// Values a template can refer to.
#[derive(Debug, Clone, Default)]
pub struct TemplateFields<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub uploader: Option<&'a str>,
    pub artist: Option<&'a str>,
    pub album: Option<&'a str>,
    pub ext: &'a str,
}

impl TemplateFields<'_> {
    fn lookup(&self, field: &str) -> &str {
        let value = match field {
            "id" => Some(self.id),
            "title" => Some(self.title),
            "uploader" | "channel" => self.uploader,
            "artist" => self.artist.or(self.uploader),
            "album" => self.album,
            "ext" => Some(self.ext),
            _ => None,
        };
        value.filter(|value| !value.trim().is_empty()).unwrap_or(MISSING)
    }
}

enum Piece<'t> {
    Literal(&'t str),
    Percent,
    Field(&'t str),
}

fn parse(template: &str) -> Result<Vec<Piece<'_>>> {
    let mut pieces = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find('%') {
        if start > 0 {
            pieces.push(Piece::Literal(&rest[..start]));
        }
        let after = &rest[start + 1..];
        if let Some(tail) = after.strip_prefix('%') {
            pieces.push(Piece::Percent);
            rest = tail;
        } else if let Some(inner) = after.strip_prefix('(') {
            let Some(close) = inner.find(')') else {
                bail!("unterminated field in output template {template:?}");
            };
            let field = inner[..close].trim();
            if field.is_empty() {
                bail!("empty field name in output template {template:?}");
            }
            // Conversion character after `)`, normally `s`.
            let tail = &inner[close + 1..];
            let mut chars = tail.chars();
            match chars.next() {
                Some(conv) if conv.is_ascii_alphabetic() => {}
                _ => bail!("field %({field}) is missing its conversion (e.g. %({field})s)"),
            }
            pieces.push(Piece::Field(field));
            rest = chars.as_str();
        } else {
            pieces.push(Piece::Literal("%"));
            rest = after;
        }
    }
    if !rest.is_empty() {
        pieces.push(Piece::Literal(rest));
    }
    Ok(pieces)
}

/// Checks a template's syntax without rendering it.
pub fn validate(template: &str) -> Result<()> {
    if template.trim().is_empty() {
        bail!("output template is empty");
    }
    if template.starts_with('/') || template.starts_with('\\') {
        bail!("output template {template:?} must be relative to the output directory");
    }
    parse(template).map(|_| ())
}

/// Renders `template` into a path relative to the output directory. The
/// extension is appended when the template does not already end with it.
pub fn render(template: &str, fields: &TemplateFields<'_>) -> Result<PathBuf> {
    validate(template)?;

    let mut rendered = String::new();
    for piece in parse(template)? {
        match piece {
            Piece::Literal(text) => rendered.push_str(text),
            Piece::Percent => rendered.push('%'),
            Piece::Field(field) => rendered.push_str(&sanitize_component(fields.lookup(field))),
        }
    }

    let mut components: Vec<String> = Vec::new();
    for raw in rendered.split(['/', '\\']) {
        let component = raw.trim();
        if component.is_empty() || component == "." {
            continue;
        }
        if component == ".." {
            bail!("output template {template:?} may not leave the output directory");
        }
        components.push(truncate(component).to_string());
    }

    let Some(file_name) = components.last_mut() else {
        bail!("output template {template:?} renders an empty file name");
    };
    let suffix = format!(".{}", fields.ext);
    if !fields.ext.is_empty() && !file_name.to_lowercase().ends_with(&suffix.to_lowercase()) {
        file_name.push_str(&suffix);
    }

    Ok(components.iter().collect())
}

/// Makes a value safe to use as one path component.
pub fn sanitize_component(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches(['.', ' ']).trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

fn truncate(component: &str) -> &str {
    if component.len() <= MAX_COMPONENT_BYTES {
        return component;
    }
    let mut end = MAX_COMPONENT_BYTES;
    while !component.is_char_boundary(end) {
        end -= 1;
    }
    &component[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fields() -> TemplateFields<'static> {
        TemplateFields {
            id: "abc123",
            title: "Song: Live/Remix?",
            uploader: Some("Some Band"),
            artist: None,
            album: None,
            ext: "wav",
        }
    }

    #[test]
    fn default_template_uses_title_and_extension() -> Result<()> {
        let path = render(DEFAULT_TEMPLATE, &fields())?;
        assert_eq!(path, Path::new("Song_ Live_Remix_.wav"));
        Ok(())
    }

    #[test]
    fn template_directories_are_kept_but_values_cannot_add_any() -> Result<()> {
        let path = render("%(uploader)s/%(id)s - %(title)s.%(ext)s", &fields())?;
        assert_eq!(
            path,
            Path::new("Some Band").join("abc123 - Song_ Live_Remix_.wav")
        );
        Ok(())
    }

    #[test]
    fn missing_and_unknown_fields_render_na() -> Result<()> {
        let path = render("%(album)s-%(view_count)s", &fields())?;
        assert_eq!(path, Path::new("NA-NA.wav"));
        Ok(())
    }

    #[test]
    fn artist_falls_back_to_uploader() -> Result<()> {
        assert_eq!(render("%(artist)s", &fields())?, Path::new("Some Band.wav"));
        Ok(())
    }

    #[test]
    fn percent_escapes_and_stray_percent() -> Result<()> {
        assert_eq!(
            render("100%% %(id)s 50%", &fields())?,
            Path::new("100% abc123 50%.wav")
        );
        Ok(())
    }

    #[test]
    fn rejects_escapes_and_bad_syntax() {
        assert!(render("../%(title)s", &fields()).is_err());
        assert!(render("/abs/%(title)s", &fields()).is_err());
        assert!(validate("%(title").is_err());
        assert!(validate("%(title)").is_err());
        assert!(validate("").is_err());
        assert!(validate("%(uploader)s/%(title)s.%(ext)s").is_ok());
    }

    #[test]
    fn sanitize_component_handles_dots_and_empties() {
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component("  a\tb  "), "a b");
        assert_eq!(sanitize_component("name..."), "name");
        assert_eq!(sanitize_component("a|b*c"), "a_b_c");
    }

    #[test]
    fn long_components_are_truncated_on_char_boundary() -> Result<()> {
        let title = "é".repeat(300);
        let path = render(
            "%(title)s",
            &TemplateFields {
                title: &title,
                ext: "mp3",
                ..fields()
            },
        )?;
        let name = path.to_string_lossy().into_owned();
        assert!(name.ends_with(".mp3"));
        assert!(name.len() <= MAX_COMPONENT_BYTES + 4);
        Ok(())
    }
}
