//! Customer identity normalization shared by the store backends and the router.

/// Strips `+`, spaces, and any `@c.us`/`@g.us`/`@lid` suffix, leaving digits only.
pub fn normalize_whatsapp_contact(contact: &str) -> String {
    let stripped = contact.split('@').next().unwrap_or(contact);
    stripped.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// The tolerant lookup forms for a normalized WhatsApp number: the digits as
/// given, plus the 0-prefixed/0-stripped alternate.
pub fn whatsapp_lookup_forms(contact: &str) -> Vec<String> {
    let digits = normalize_whatsapp_contact(contact);
    let mut forms = vec![digits.clone()];
    if let Some(stripped) = digits.strip_prefix('0') {
        forms.push(stripped.to_string());
    } else {
        forms.push(format!("0{digits}"));
    }
    forms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_whatsapp_suffixes_and_symbols() {
        assert_eq!(normalize_whatsapp_contact("+1 555 0100@c.us"), "15550100");
        assert_eq!(normalize_whatsapp_contact("15550100@g.us"), "15550100");
        assert_eq!(normalize_whatsapp_contact("15550100@lid"), "15550100");
    }

    #[test]
    fn lookup_forms_include_prefix_variant() {
        let forms = whatsapp_lookup_forms("0155510");
        assert!(forms.contains(&"0155510".to_string()));
        assert!(forms.contains(&"155510".to_string()));
    }
}
