/// Bump when tokenization changes; persisted indexes with a different
/// version are rebuilt on load.
pub const TOKENIZER_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    En,
    Zh,
}

/// A document is treated as Chinese when more than 30% of its
/// non-whitespace characters are CJK.
pub fn detect_language(text: &str) -> Language {
    let mut total = 0usize;
    let mut cjk = 0usize;
    for c in text.chars() {
        if c.is_whitespace() {
            continue;
        }
        total += 1;
        if is_cjk(c) {
            cjk += 1;
        }
    }
    if total > 0 && (cjk as f64) / (total as f64) > 0.3 {
        Language::Zh
    } else {
        Language::En
    }
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Tokenize with the strategy matching the text's detected language.
pub fn tokenize(text: &str) -> Vec<String> {
    match detect_language(text) {
        Language::Zh => tokenize_zh(text),
        Language::En => tokenize_en(text),
    }
}

/// English/latin strategy: word segmentation on alphanumeric runs,
/// lowercased, with stopwords removed. Digits are kept.
pub fn tokenize_en(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            push_en_token(&mut tokens, std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        push_en_token(&mut tokens, current);
    }
    tokens
}

fn push_en_token(tokens: &mut Vec<String>, token: String) {
    if !STOPWORDS.contains(&token.as_str()) {
        tokens.push(token);
    }
}

/// Chinese strategy: each CJK character plus consecutive-character bigrams;
/// embedded latin/digit runs become lowercased word tokens.
pub fn tokenize_zh(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cjk_run: Vec<char> = Vec::new();
    let mut latin_run = String::new();

    let mut flush_cjk = |run: &mut Vec<char>, tokens: &mut Vec<String>| {
        for (i, c) in run.iter().enumerate() {
            tokens.push(c.to_string());
            if i + 1 < run.len() {
                let mut bigram = String::with_capacity(8);
                bigram.push(*c);
                bigram.push(run[i + 1]);
                tokens.push(bigram);
            }
        }
        run.clear();
    };

    for c in text.chars() {
        if is_cjk(c) {
            if !latin_run.is_empty() {
                tokens.push(std::mem::take(&mut latin_run));
            }
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            if !cjk_run.is_empty() {
                flush_cjk(&mut cjk_run, &mut tokens);
            }
            latin_run.extend(c.to_lowercase());
        } else {
            if !cjk_run.is_empty() {
                flush_cjk(&mut cjk_run, &mut tokens);
            }
            if !latin_run.is_empty() {
                tokens.push(std::mem::take(&mut latin_run));
            }
        }
    }
    if !cjk_run.is_empty() {
        flush_cjk(&mut cjk_run, &mut tokens);
    }
    if !latin_run.is_empty() {
        tokens.push(latin_run);
    }
    tokens
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has", "have",
    "he", "her", "his", "i", "if", "in", "into", "is", "it", "its", "no", "not", "of", "on", "or",
    "our", "she", "so", "such", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "to", "was", "we", "were", "which", "will", "with", "you", "your",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("The cat sat on the mat."), Language::En);
        assert_eq!(detect_language("知识库检索系统"), Language::Zh);
        // Mixed text below the 30% threshold stays English.
        assert_eq!(detect_language("BM25 ranking with 中文 inside a long english sentence"), Language::En);
    }

    #[test]
    fn test_en_lowercases_and_drops_stopwords() {
        let tokens = tokenize_en("The Cat sat on the MAT");
        assert_eq!(tokens, vec!["cat", "sat", "mat"]);
    }

    #[test]
    fn test_en_keeps_digits() {
        let tokens = tokenize_en("version 2 of bm25");
        assert_eq!(tokens, vec!["version", "2", "bm25"]);
    }

    #[test]
    fn test_zh_chars_and_bigrams() {
        let tokens = tokenize_zh("知识库");
        assert_eq!(tokens, vec!["知", "知识", "识", "识库", "库"]);
    }

    #[test]
    fn test_zh_runs_do_not_bridge_punctuation() {
        let tokens = tokenize_zh("知识，库");
        // No bigram across the comma.
        assert!(tokens.contains(&"知识".to_string()));
        assert!(!tokens.contains(&"识库".to_string()));
    }

    #[test]
    fn test_zh_mixed_latin() {
        let tokens = tokenize_zh("用BM25检索");
        assert!(tokens.contains(&"bm25".to_string()));
        assert!(tokens.contains(&"检索".to_string()));
    }

    #[test]
    fn test_empty_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("   ").is_empty());
    }
}
