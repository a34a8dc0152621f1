use std::path::PathBuf;

use crate::{BuildSettings, DocumentUri, FallbackOptions, Language};

/// Computes best-effort settings from the file extension alone.
///
/// No I/O and no state beyond the options fixed at construction: the same
/// document always yields the same settings. The document path itself is
/// never part of the arguments, so two documents with the same extension get
/// identical argument lists.
#[derive(Debug, Clone, Default)]
pub struct FallbackSettingsComputer {
    options: FallbackOptions,
}

impl FallbackSettingsComputer {
    pub fn new(options: FallbackOptions) -> Self {
        Self { options }
    }

    pub fn compute(&self, document: &DocumentUri) -> BuildSettings {
        let language = Language::of_document(document);
        let working_directory = document
            .path()
            .and_then(|p| p.parent().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        BuildSettings::fallback(language, self.arguments(language), working_directory)
    }

    fn arguments(&self, language: Language) -> Vec<String> {
        let mut args: Vec<String> = match language {
            Language::C => vec!["-std=c11".into()],
            Language::Cpp => vec!["-std=c++17".into()],
            Language::ObjC => vec!["-x".into(), "objective-c".into()],
            Language::ObjCpp => vec![
                "-x".into(),
                "objective-c++".into(),
                "-std=c++17".into(),
            ],
            Language::Swift | Language::Other => Vec::new(),
        };

        if let Some(sdk) = &self.options.sdk {
            match language {
                Language::Swift => {
                    args.push("-sdk".into());
                    args.push(sdk.display().to_string());
                }
                l if l.is_c_family() => {
                    args.push("-isysroot".into());
                    args.push(sdk.display().to_string());
                }
                _ => {}
            }
        }

        match language {
            Language::C | Language::ObjC => args.extend(self.options.c_flags.iter().cloned()),
            Language::Cpp | Language::ObjCpp => {
                args.extend(self.options.cxx_flags.iter().cloned())
            }
            Language::Swift => args.extend(self.options.swift_flags.iter().cloned()),
            Language::Other => {}
        }
        args
    }
}
