// Presentation
//
// Localized layout of a policy's option controls, as resolved by the ADML
// loader. The cache stores it verbatim as JSON next to the display strings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presentation {
    pub id: String,
    #[serde(default)]
    pub elements: Vec<PresentationElement>,
}

/// A single control. `ref_id` names the policy element it edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "camelCase")]
pub enum PresentationElement {
    Label {
        text: String,
    },
    DecimalTextBox {
        ref_id: String,
        label: String,
        #[serde(default)]
        default_value: u32,
        #[serde(default)]
        spin_step: Option<u32>,
    },
    TextBox {
        ref_id: String,
        label: String,
        #[serde(default)]
        default_value: Option<String>,
    },
    CheckBox {
        ref_id: String,
        label: String,
        #[serde(default)]
        default_checked: bool,
    },
    ComboBox {
        ref_id: String,
        label: String,
        #[serde(default)]
        suggestions: Vec<String>,
    },
    DropdownList {
        ref_id: String,
        label: String,
        #[serde(default)]
        default_item: Option<u32>,
    },
    ListBox {
        ref_id: String,
        label: String,
    },
    MultiTextBox {
        ref_id: String,
        label: String,
    },
}

impl PresentationElement {
    pub fn ref_id(&self) -> Option<&str> {
        match self {
            PresentationElement::Label { .. } => None,
            PresentationElement::DecimalTextBox { ref_id, .. }
            | PresentationElement::TextBox { ref_id, .. }
            | PresentationElement::CheckBox { ref_id, .. }
            | PresentationElement::ComboBox { ref_id, .. }
            | PresentationElement::DropdownList { ref_id, .. }
            | PresentationElement::ListBox { ref_id, .. }
            | PresentationElement::MultiTextBox { ref_id, .. } => Some(ref_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controls_are_tagged_in_json() {
        let presentation = Presentation {
            id: "Timeout_Presentation".into(),
            elements: vec![
                PresentationElement::Label {
                    text: "Seconds before lock:".into(),
                },
                PresentationElement::DecimalTextBox {
                    ref_id: "Timeout".into(),
                    label: "Seconds".into(),
                    default_value: 900,
                    spin_step: Some(60),
                },
            ],
        };

        let json = serde_json::to_value(&presentation).unwrap();
        assert_eq!(json["elements"][1]["control"], "decimalTextBox");
        assert_eq!(presentation.elements[1].ref_id(), Some("Timeout"));
        assert_eq!(presentation.elements[0].ref_id(), None);
    }
}
