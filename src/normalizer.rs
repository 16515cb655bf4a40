use std::collections::HashSet;

use tracing::{debug, warn};

use crate::error::NormalizeError;
use crate::extractor::RawField;
use crate::fetcher::PageId;
use crate::reading::{object_id, Reading, ReadingKind, Unit};

/// Totals-page labels, matched exactly.
const TOTAL_LABELS: &[(&str, ReadingKind)] = &[
    ("使用量", ReadingKind::TotalUsage),
    ("購入量", ReadingKind::Purchased),
    ("買電量", ReadingKind::Purchased),
    ("売電量", ReadingKind::Sold),
    ("発電量", ReadingKind::Generated),
];

/// Circuit-name words with an established English slug.
const CIRCUIT_WORDS: &[(&str, &str)] = &[
    ("エアコン", "aircon"),
    ("冷蔵庫", "refrigerator"),
    ("洗濯機", "washer"),
    ("乾燥機", "dryer"),
    ("浴室乾燥機", "bath-dryer"),
    ("食洗機", "dishwasher"),
    ("食器洗い乾燥機", "dishwasher"),
    ("電子レンジ", "microwave"),
    ("照明", "lighting"),
    ("電灯", "lights"),
    ("コンセント", "outlet"),
    ("キッチン", "kitchen"),
    ("台所", "kitchen"),
    ("リビング", "living"),
    ("ダイニング", "dining"),
    ("寝室", "bedroom"),
    ("子供部屋", "kids-room"),
    ("和室", "japanese-room"),
    ("洋室", "western-room"),
    ("浴室", "bathroom"),
    ("洗面所", "washroom"),
    ("トイレ", "toilet"),
    ("玄関", "entrance"),
    ("廊下", "hallway"),
    ("書斎", "study"),
    ("給湯器", "water-heater"),
    ("エコキュート", "ecocute"),
    ("床暖房", "floor-heating"),
    ("太陽光", "solar"),
    ("蓄電池", "battery"),
    ("電気自動車", "ev"),
    ("クッキングヒーター", "cooktop"),
    ("換気扇", "fan"),
    ("主幹", "main"),
    ("回路", "circuit"),
    ("その他", "other"),
    ("予備", "spare"),
    ("階", "floor"),
];

/// Turns the raw fields of one page kind into readings.
///
/// Circuit fields from every circuit screen must be passed in one call so identifiers
/// are disambiguated across the whole list.
pub fn normalize(fields: &[RawField], page: PageId) -> Result<Vec<Reading>, NormalizeError> {
    match page {
        PageId::Totals => normalize_totals(fields),
        PageId::Circuits(_) => normalize_circuits(fields),
        PageId::Climate | PageId::Home => {
            debug!("No field normalization for {}", page);
            Ok(Vec::new())
        }
    }
}

fn normalize_totals(fields: &[RawField]) -> Result<Vec<Reading>, NormalizeError> {
    let mut values: [Option<f64>; 4] = [None; 4];

    for field in fields {
        let Some(kind) = TOTAL_LABELS
            .iter()
            .find(|(label, _)| *label == field.label)
            .map(|(_, kind)| *kind)
        else {
            warn!("Unexpected label `{}` on the totals page", field.label);
            continue;
        };
        let Some(slot) = ReadingKind::TOTALS.iter().position(|k| *k == kind) else {
            continue;
        };
        if values[slot].is_some() {
            return Err(NormalizeError::DuplicateLabel(field.label.clone()));
        }
        let (value, unit) = field_value(field, Unit::KilowattHour)?;
        if value < 0.0 {
            return Err(NormalizeError::BadNumber {
                label: field.label.clone(),
                text: field.value.clone(),
            });
        }
        if unit != Unit::KilowattHour {
            return Err(NormalizeError::UnknownUnit {
                label: field.label.clone(),
                unit: unit.symbol().to_string(),
            });
        }
        values[slot] = Some(value);
    }

    let missing: Vec<&'static str> = ReadingKind::TOTALS
        .iter()
        .zip(values.iter())
        .filter(|(_, value)| value.is_none())
        .filter_map(|(kind, _)| kind.total_key())
        .collect();
    if !missing.is_empty() {
        return Err(NormalizeError::IncompleteTotals(missing));
    }

    Ok(ReadingKind::TOTALS
        .iter()
        .zip(values)
        .filter_map(|(kind, value)| value.and_then(|v| Reading::total(*kind, v)))
        .collect())
}

fn normalize_circuits(fields: &[RawField]) -> Result<Vec<Reading>, NormalizeError> {
    let mut keys = KeyAllocator::new();
    fields
        .iter()
        .map(|field| {
            let (value, unit) = field_value(field, Unit::KilowattHour)?;
            Ok(Reading {
                key: keys.assign(slugify(&field.label)),
                value,
                unit,
                kind: ReadingKind::Circuit,
                name: Some(field.label.clone()),
            })
        })
        .collect()
}

fn field_value(field: &RawField, default: Unit) -> Result<(f64, Unit), NormalizeError> {
    let value = parse_number(&field.value).ok_or_else(|| NormalizeError::BadNumber {
        label: field.label.clone(),
        text: field.value.clone(),
    })?;
    let Some(unit) = field.unit.as_deref() else {
        return Ok((value, default));
    };
    let folded: String = fold_width(unit)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    match folded.to_ascii_lowercase().as_str() {
        "kwh" => Ok((value, Unit::KilowattHour)),
        "wh" => Ok((value / 1000.0, Unit::KilowattHour)),
        "w" => Ok((value, Unit::Watt)),
        "kw" => Ok((value * 1000.0, Unit::Watt)),
        _ => Err(NormalizeError::UnknownUnit {
            label: field.label.clone(),
            unit: unit.to_string(),
        }),
    }
}

/// Hands out unique keys in call order: `aircon`, `aircon-2`, `aircon-3`, ...
///
/// Keys are compared by [`object_id`], so `total-use` collides with `total_use`.
/// The totals keys are always taken.
#[derive(Debug, Clone)]
pub struct KeyAllocator {
    used: HashSet<String>,
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyAllocator {
    pub fn new() -> Self {
        Self::reserving(std::iter::empty::<&str>())
    }

    /// An allocator that also treats `keys` as taken.
    pub fn reserving<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let mut used: HashSet<String> = ReadingKind::TOTALS
            .iter()
            .filter_map(|kind| kind.total_key())
            .map(object_id)
            .collect();
        used.extend(keys.into_iter().map(object_id));
        Self { used }
    }

    pub fn assign(&mut self, slug: String) -> String {
        if self.used.insert(object_id(&slug)) {
            return slug;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{slug}-{n}");
            if self.used.insert(object_id(&candidate)) {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Folds full-width ASCII variants and the ideographic space to plain ASCII.
pub fn fold_width(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            '\u{3000}' => ' ',
            '\u{2212}' => '-',
            _ => c,
        })
        .collect()
}

/// Parses a locale-formatted number: full-width digits, grouping commas and
/// decimal commas are all accepted. Anything else is `None`, never zero.
pub fn parse_number(text: &str) -> Option<f64> {
    let folded: String = fold_width(text)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if folded.is_empty() {
        return None;
    }

    let normalized = match (folded.rfind('.'), folded.rfind(',')) {
        (Some(dot), Some(comma)) if dot > comma => {
            grouped(&folded[..dot], ',')?;
            folded.replace(',', "")
        }
        (Some(_), Some(comma)) => {
            grouped(&folded[..comma], '.')?;
            folded.replace('.', "").replace(',', ".")
        }
        (None, Some(comma)) => {
            let decimals = folded.len() - comma - 1;
            if folded.matches(',').count() == 1 && decimals != 3 {
                folded.replace(',', ".")
            } else {
                grouped(&folded, ',')?;
                folded.replace(',', "")
            }
        }
        _ => folded,
    };

    if !normalized
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'))
    {
        return None;
    }
    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Checks the thousands grouping of an integer part: every group after the first
/// has exactly three digits.
fn grouped(integer: &str, separator: char) -> Option<()> {
    let mut groups = integer.split(separator);
    let lead = groups.next()?.trim_start_matches(['-', '+']);
    if lead.is_empty() || lead.len() > 3 {
        return None;
    }
    groups
        .all(|group| group.len() == 3 && group.chars().all(|c| c.is_ascii_digit()))
        .then_some(())
}

/// Stable identifier for a circuit display name, e.g. `エアコン` → `aircon`.
pub fn slugify(name: &str) -> String {
    let chars: Vec<char> = fold_width(name).chars().collect();
    let mut slug = String::new();
    let mut kana: Vec<char> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if let Some((len, word)) = circuit_word_at(&chars[i..]) {
            flush_kana(&mut slug, &mut kana);
            slug.push('-');
            slug.push_str(word);
            slug.push('-');
            i += len;
            continue;
        }

        let c = chars[i];
        if let Some(k) = as_katakana(c) {
            kana.push(k);
        } else {
            flush_kana(&mut slug, &mut kana);
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if c.is_alphanumeric() {
                slug.push_str(&format!("-{:x}-", c as u32));
            } else {
                slug.push('-');
            }
        }
        i += 1;
    }
    flush_kana(&mut slug, &mut kana);

    let slug = slug
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "circuit".to_string()
    } else {
        slug
    }
}

/// Longest dictionary word starting at the head of `chars`.
fn circuit_word_at(chars: &[char]) -> Option<(usize, &'static str)> {
    CIRCUIT_WORDS
        .iter()
        .filter_map(|(word, slug)| {
            let len = word.chars().count();
            let matches = chars.len() >= len && word.chars().zip(chars).all(|(a, b)| a == *b);
            matches.then_some((len, *slug))
        })
        .max_by_key(|(len, _)| *len)
}

fn flush_kana(slug: &mut String, kana: &mut Vec<char>) {
    if kana.is_empty() {
        return;
    }
    slug.push('-');
    slug.push_str(&romanize(kana));
    slug.push('-');
    kana.clear();
}

/// Hiragana is shifted onto katakana so one table covers both.
fn as_katakana(c: char) -> Option<char> {
    match c {
        '\u{3041}'..='\u{3096}' => char::from_u32(c as u32 + 0x60),
        '\u{30A1}'..='\u{30FA}' | 'ー' => Some(c),
        _ => None,
    }
}

fn romanize(kana: &[char]) -> String {
    let mut out = String::new();
    let mut geminate = false;
    let mut i = 0;

    while i < kana.len() {
        let c = kana[i];
        if c == 'ッ' {
            geminate = true;
            i += 1;
            continue;
        }
        if c == 'ー' {
            i += 1;
            continue;
        }

        let mut syllable = kana_syllable(c).to_string();
        if let Some(combined) = kana.get(i + 1).and_then(|next| combine(&syllable, *next)) {
            syllable = combined;
            i += 1;
        }
        if geminate {
            if syllable.starts_with("ch") {
                out.push('t');
            } else if let Some(first) = syllable.chars().next().filter(|f| !"aiueon".contains(*f)) {
                out.push(first);
            }
            geminate = false;
        }
        out.push_str(&syllable);
        i += 1;
    }
    out
}

/// Folds a small kana into the preceding syllable: キ+ャ → kya, フ+ァ → fa.
fn combine(base: &str, small: char) -> Option<String> {
    match small {
        'ャ' | 'ュ' | 'ョ' => {
            let vowel = match small {
                'ャ' => 'a',
                'ュ' => 'u',
                _ => 'o',
            };
            let stem = base.strip_suffix('i').filter(|s| !s.is_empty())?;
            if stem.ends_with("sh") || stem.ends_with("ch") || stem.ends_with('j') {
                Some(format!("{stem}{vowel}"))
            } else {
                Some(format!("{stem}y{vowel}"))
            }
        }
        'ァ' | 'ィ' | 'ゥ' | 'ェ' | 'ォ' => {
            let vowel = kana_syllable(small);
            match base {
                "u" => Some(format!("w{vowel}")),
                "fu" => Some(format!("f{vowel}")),
                "vu" => Some(format!("v{vowel}")),
                _ => {
                    let stem = base
                        .strip_suffix(['a', 'i', 'u', 'e', 'o'])
                        .filter(|s| !s.is_empty())?;
                    Some(format!("{stem}{vowel}"))
                }
            }
        }
        _ => None,
    }
}

fn kana_syllable(c: char) -> &'static str {
    match c {
        'ア' | 'ァ' => "a",
        'イ' | 'ィ' => "i",
        'ウ' | 'ゥ' => "u",
        'エ' | 'ェ' => "e",
        'オ' | 'ォ' | 'ヲ' => "o",
        'カ' | 'ヵ' => "ka",
        'キ' => "ki",
        'ク' => "ku",
        'ケ' | 'ヶ' => "ke",
        'コ' => "ko",
        'ガ' => "ga",
        'ギ' => "gi",
        'グ' => "gu",
        'ゲ' => "ge",
        'ゴ' => "go",
        'サ' => "sa",
        'シ' => "shi",
        'ス' => "su",
        'セ' => "se",
        'ソ' => "so",
        'ザ' => "za",
        'ジ' | 'ヂ' => "ji",
        'ズ' | 'ヅ' => "zu",
        'ゼ' => "ze",
        'ゾ' => "zo",
        'タ' => "ta",
        'チ' => "chi",
        'ツ' => "tsu",
        'テ' => "te",
        'ト' => "to",
        'ダ' => "da",
        'デ' => "de",
        'ド' => "do",
        'ナ' => "na",
        'ニ' => "ni",
        'ヌ' => "nu",
        'ネ' => "ne",
        'ノ' => "no",
        'ハ' => "ha",
        'ヒ' => "hi",
        'フ' => "fu",
        'ヘ' => "he",
        'ホ' => "ho",
        'バ' => "ba",
        'ビ' => "bi",
        'ブ' => "bu",
        'ベ' => "be",
        'ボ' => "bo",
        'パ' => "pa",
        'ピ' => "pi",
        'プ' => "pu",
        'ペ' => "pe",
        'ポ' => "po",
        'マ' => "ma",
        'ミ' => "mi",
        'ム' => "mu",
        'メ' => "me",
        'モ' => "mo",
        'ヤ' | 'ャ' => "ya",
        'ユ' | 'ュ' => "yu",
        'ヨ' | 'ョ' => "yo",
        'ラ' => "ra",
        'リ' => "ri",
        'ル' => "ru",
        'レ' => "re",
        'ロ' => "ro",
        'ワ' | 'ヮ' => "wa",
        'ヰ' => "i",
        'ヱ' => "e",
        'ン' => "n",
        'ヴ' => "vu",
        'ヷ' => "va",
        'ヸ' => "vi",
        'ヹ' => "ve",
        'ヺ' => "vo",
        _ => "",
    }
}
