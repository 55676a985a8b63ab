use std::sync::Arc;

/// Something that contributes a suffix to the uploaded object's name
pub trait FileExtProvider {
    fn file_ext(&self) -> Option<Arc<str>>;
}

/// `base` followed by each provider's extension in order, e.g. `name.tar.gpg`.
pub fn file_name_with_exts(base: &str, providers: &[&dyn FileExtProvider]) -> String {
    providers
        .iter()
        .filter_map(|p| p.file_ext())
        .fold(base.to_string(), |mut name, ext| {
            name.push('.');
            name.push_str(&ext);
            name
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ext(Option<&'static str>);

    impl FileExtProvider for Ext {
        fn file_ext(&self) -> Option<Arc<str>> {
            self.0.map(Arc::from)
        }
    }

    #[test]
    fn test_extensions_appended_in_order() {
        let name = file_name_with_exts("2024-01-01_00:00_vm1", &[&Ext(Some("tar")), &Ext(None), &Ext(Some("gpg"))]);
        assert_eq!(name, "2024-01-01_00:00_vm1.tar.gpg");
    }

    #[test]
    fn test_no_extensions() {
        assert_eq!(file_name_with_exts("vm1", &[]), "vm1");
    }
}
