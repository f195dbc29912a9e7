/// Tag assumed when a declaration names no tag.
pub const DEFAULT_TAG: &str = "latest";

const MAX_TAG_LEN: usize = 128;

/// One `FROM` declaration pulled out of a manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromDeclaration {
    pub image_name: String,
    pub tag: String,
    /// The image token exactly as written (`python:3.9-slim`, `node`).
    pub declared: String,
}

/// Parse one manifest line. Returns `None` for anything that is not an
/// updatable `FROM image[:tag]` declaration.
pub fn parse_from_line(line: &str) -> Option<FromDeclaration> {
    let mut tokens = line.split_whitespace();
    let keyword = tokens.next()?;
    if !keyword.eq_ignore_ascii_case("FROM") {
        return None;
    }

    let token = tokens.find(|t| !t.starts_with("--"))?;
    if token.contains('$') || token.contains('@') || token.eq_ignore_ascii_case("scratch") {
        return None;
    }

    let (image_name, tag) = split_tag(token);
    if !is_valid_name(image_name) || !is_valid_tag(tag) {
        return None;
    }

    Some(FromDeclaration {
        image_name: image_name.to_string(),
        tag: tag.to_string(),
        declared: token.to_string(),
    })
}

/// Split `name[:tag]`, leaving registry ports (`host:5000/app`) in the name.
pub fn split_tag(token: &str) -> (&str, &str) {
    match token.rfind(':') {
        Some(idx) if !token[idx + 1..].contains('/') => (&token[..idx], &token[idx + 1..]),
        _ => (token, DEFAULT_TAG),
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && name.chars().all(|c| {
            c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || matches!(c, '.' | '_' | '-' | '/' | ':')
        })
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
