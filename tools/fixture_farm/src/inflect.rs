//! Entity type names to fixture file stems and naming segments.

const UNCOUNTABLE: &[&str] = &[
    "equipment",
    "information",
    "rice",
    "money",
    "species",
    "series",
    "fish",
    "sheep",
    "jeans",
    "police",
];

const IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("man", "men"),
    ("child", "children"),
    ("sex", "sexes"),
    ("move", "moves"),
    ("zombie", "zombies"),
];

/// `Admin::UserProfile` -> `admin/user_profile`.
pub fn underscore(type_name: &str) -> String {
    let path = type_name.replace("::", "/");
    let chars = path.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(path.len() + 4);
    for (index, ch) in chars.iter().enumerate() {
        if ch.is_ascii_uppercase() && index > 0 {
            let prev = chars[index - 1];
            let next_is_lower = chars
                .get(index + 1)
                .is_some_and(|next| next.is_ascii_lowercase());
            let boundary = prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower);
            if boundary {
                out.push('_');
            }
        }
        out.push(if *ch == '-' { '_' } else { ch.to_ascii_lowercase() });
    }
    out
}

/// Last underscored segment: `Admin::UserProfile` -> `user_profile`.
pub fn local_name(type_name: &str) -> String {
    let underscored = underscore(type_name);
    match underscored.rsplit_once('/') {
        Some((_, last)) => last.to_string(),
        None => underscored,
    }
}

/// Relative fixture file stem: `Admin::User` -> `admin/users`.
pub fn fixture_file_stem(type_name: &str) -> String {
    let underscored = underscore(type_name);
    match underscored.rsplit_once('/') {
        Some((namespace, last)) => format!("{namespace}/{}", pluralize(last)),
        None => pluralize(&underscored),
    }
}

pub fn pluralize(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }
    let (head, last) = match word.rsplit_once('_') {
        Some((head, last)) => (format!("{head}_"), last),
        None => (String::new(), word),
    };
    if UNCOUNTABLE.contains(&last) {
        return word.to_string();
    }
    if let Some((_, plural)) = IRREGULAR.iter().find(|(singular, _)| *singular == last) {
        return format!("{head}{plural}");
    }
    format!("{head}{}", pluralize_regular(last))
}

fn pluralize_regular(word: &str) -> String {
    for stem in ["matr", "vert", "ind"] {
        for ending in ["ix", "ex"] {
            if word.len() == stem.len() + ending.len()
                && word.starts_with(stem)
                && word.ends_with(ending)
            {
                return format!("{stem}ices");
            }
        }
    }
    if word.ends_with("quiz") {
        return format!("{word}zes");
    }
    if word == "buffalo" || word == "tomato" {
        return format!("{word}es");
    }
    if ["s", "x", "z", "ch", "sh"]
        .iter()
        .any(|ending| word.ends_with(ending))
    {
        return format!("{word}es");
    }
    if let Some(stem) = word.strip_suffix('y') {
        let vowel_before = stem
            .chars()
            .last()
            .is_some_and(|ch| matches!(ch, 'a' | 'e' | 'i' | 'o' | 'u'));
        if !vowel_before && !stem.ends_with("qu") {
            return format!("{stem}ies");
        }
    }
    if let Some(stem) = word.strip_suffix("fe") {
        if !stem.ends_with('f') {
            return format!("{stem}ves");
        }
    }
    if let Some(stem) = word.strip_suffix('f') {
        if stem.ends_with('l') || stem.ends_with('r') {
            return format!("{stem}ves");
        }
    }
    format!("{word}s")
}
