//! 静态临床知识表
//!
//! 相互作用、治疗类别、禁忌症、剂量阈值与过敏交叉反应表。
//! 所有匹配均为不区分大小写的子串匹配。

use mtr_core::utils::terms_overlap;
use mtr_core::MedicationEntry;

/// 未归类药物所属的类别，不参与重复用药判断
pub const OTHER_CLASS: &str = "other";

/// 药物相互作用条目
#[derive(Debug, Clone, Copy)]
pub struct InteractionRule {
    pub drugs: (&'static str, &'static str),
    pub description: &'static str,
    pub clinical_significance: &'static str,
}

/// 药物 -> 治疗类别
#[derive(Debug, Clone, Copy)]
pub struct ClassRule {
    pub drug: &'static str,
    pub class: &'static str,
}

/// 药物 -> 禁忌疾病
#[derive(Debug, Clone, Copy)]
pub struct ContraindicationRule {
    pub drug: &'static str,
    pub conditions: &'static [&'static str],
    pub rationale: &'static str,
}

/// 单次剂量阈值（mg）
#[derive(Debug, Clone, Copy)]
pub struct DoseRule {
    pub drug: &'static str,
    pub low_mg: f64,
    pub high_mg: f64,
}

/// 过敏原 -> 交叉过敏药物
#[derive(Debug, Clone, Copy)]
pub struct AllergyClassRule {
    pub allergen: &'static str,
    pub members: &'static [&'static str],
}

const INTERACTIONS: &[InteractionRule] = &[
    InteractionRule {
        drugs: ("warfarin", "aspirin"),
        description: "additive anticoagulant and antiplatelet effect",
        clinical_significance: "Increased risk of serious bleeding",
    },
    InteractionRule {
        drugs: ("warfarin", "ibuprofen"),
        description: "NSAID potentiates anticoagulation and irritates gastric mucosa",
        clinical_significance: "Increased risk of gastrointestinal bleeding",
    },
    InteractionRule {
        drugs: ("warfarin", "amiodarone"),
        description: "amiodarone inhibits warfarin metabolism",
        clinical_significance: "Elevated INR; warfarin dose reduction usually required",
    },
    InteractionRule {
        drugs: ("lisinopril", "potassium"),
        description: "ACE inhibitor reduces potassium excretion",
        clinical_significance: "Risk of hyperkalemia",
    },
    InteractionRule {
        drugs: ("lisinopril", "spironolactone"),
        description: "combined potassium retention",
        clinical_significance: "Risk of hyperkalemia; monitor serum potassium",
    },
    InteractionRule {
        drugs: ("simvastatin", "clarithromycin"),
        description: "CYP3A4 inhibition raises statin exposure",
        clinical_significance: "Risk of myopathy and rhabdomyolysis",
    },
    InteractionRule {
        drugs: ("digoxin", "amiodarone"),
        description: "amiodarone raises digoxin levels",
        clinical_significance: "Risk of digoxin toxicity",
    },
    InteractionRule {
        drugs: ("sildenafil", "nitroglycerin"),
        description: "additive vasodilation",
        clinical_significance: "Risk of severe hypotension",
    },
    InteractionRule {
        drugs: ("fluoxetine", "tramadol"),
        description: "combined serotonergic activity",
        clinical_significance: "Risk of serotonin syndrome and seizures",
    },
    InteractionRule {
        drugs: ("clopidogrel", "omeprazole"),
        description: "CYP2C19 inhibition reduces clopidogrel activation",
        clinical_significance: "Reduced antiplatelet effect",
    },
    InteractionRule {
        drugs: ("methotrexate", "trimethoprim"),
        description: "additive antifolate effect",
        clinical_significance: "Risk of bone marrow suppression",
    },
    InteractionRule {
        drugs: ("lithium", "ibuprofen"),
        description: "NSAID reduces renal lithium clearance",
        clinical_significance: "Risk of lithium toxicity",
    },
];

const THERAPEUTIC_CLASSES: &[ClassRule] = &[
    ClassRule { drug: "metformin", class: "antidiabetic" },
    ClassRule { drug: "insulin", class: "antidiabetic" },
    ClassRule { drug: "glipizide", class: "antidiabetic" },
    ClassRule { drug: "glyburide", class: "antidiabetic" },
    ClassRule { drug: "sitagliptin", class: "antidiabetic" },
    ClassRule { drug: "lisinopril", class: "ace_inhibitor" },
    ClassRule { drug: "enalapril", class: "ace_inhibitor" },
    ClassRule { drug: "ramipril", class: "ace_inhibitor" },
    ClassRule { drug: "losartan", class: "angiotensin_receptor_blocker" },
    ClassRule { drug: "valsartan", class: "angiotensin_receptor_blocker" },
    ClassRule { drug: "metoprolol", class: "beta_blocker" },
    ClassRule { drug: "atenolol", class: "beta_blocker" },
    ClassRule { drug: "propranolol", class: "beta_blocker" },
    ClassRule { drug: "atorvastatin", class: "statin" },
    ClassRule { drug: "simvastatin", class: "statin" },
    ClassRule { drug: "rosuvastatin", class: "statin" },
    ClassRule { drug: "ibuprofen", class: "nsaid" },
    ClassRule { drug: "naproxen", class: "nsaid" },
    ClassRule { drug: "diclofenac", class: "nsaid" },
    ClassRule { drug: "omeprazole", class: "proton_pump_inhibitor" },
    ClassRule { drug: "pantoprazole", class: "proton_pump_inhibitor" },
    ClassRule { drug: "esomeprazole", class: "proton_pump_inhibitor" },
    ClassRule { drug: "sertraline", class: "ssri" },
    ClassRule { drug: "fluoxetine", class: "ssri" },
    ClassRule { drug: "citalopram", class: "ssri" },
    ClassRule { drug: "warfarin", class: "anticoagulant" },
    ClassRule { drug: "apixaban", class: "anticoagulant" },
    ClassRule { drug: "rivaroxaban", class: "anticoagulant" },
];

const CONTRAINDICATIONS: &[ContraindicationRule] = &[
    ContraindicationRule {
        drug: "metformin",
        conditions: &["kidney disease", "renal failure", "renal impairment"],
        rationale: "risk of lactic acidosis with reduced renal clearance",
    },
    ContraindicationRule {
        drug: "ibuprofen",
        conditions: &["peptic ulcer", "kidney disease", "heart failure"],
        rationale: "NSAIDs worsen ulceration, renal function and fluid retention",
    },
    ContraindicationRule {
        drug: "naproxen",
        conditions: &["peptic ulcer", "kidney disease", "heart failure"],
        rationale: "NSAIDs worsen ulceration, renal function and fluid retention",
    },
    ContraindicationRule {
        drug: "propranolol",
        conditions: &["asthma", "copd"],
        rationale: "non-selective beta blockade can trigger bronchospasm",
    },
    ContraindicationRule {
        drug: "warfarin",
        conditions: &["active bleeding", "pregnancy"],
        rationale: "anticoagulation contraindicated",
    },
    ContraindicationRule {
        drug: "lisinopril",
        conditions: &["pregnancy", "angioedema"],
        rationale: "ACE inhibitors are fetotoxic and can cause angioedema",
    },
    ContraindicationRule {
        drug: "pseudoephedrine",
        conditions: &["hypertension"],
        rationale: "sympathomimetic raises blood pressure",
    },
    ContraindicationRule {
        drug: "sildenafil",
        conditions: &["hypotension"],
        rationale: "further lowers blood pressure",
    },
];

const DOSE_LIMITS: &[DoseRule] = &[
    DoseRule { drug: "lisinopril", low_mg: 2.5, high_mg: 40.0 },
    DoseRule { drug: "metformin", low_mg: 500.0, high_mg: 2550.0 },
    DoseRule { drug: "atorvastatin", low_mg: 10.0, high_mg: 80.0 },
    DoseRule { drug: "simvastatin", low_mg: 5.0, high_mg: 40.0 },
    DoseRule { drug: "amlodipine", low_mg: 2.5, high_mg: 10.0 },
    DoseRule { drug: "metoprolol", low_mg: 25.0, high_mg: 400.0 },
    DoseRule { drug: "warfarin", low_mg: 1.0, high_mg: 10.0 },
    DoseRule { drug: "sertraline", low_mg: 25.0, high_mg: 200.0 },
    DoseRule { drug: "omeprazole", low_mg: 10.0, high_mg: 40.0 },
    DoseRule { drug: "ibuprofen", low_mg: 200.0, high_mg: 800.0 },
];

const ALLERGY_CLASSES: &[AllergyClassRule] = &[
    AllergyClassRule {
        allergen: "penicillin",
        members: &["penicillin", "amoxicillin", "ampicillin", "piperacillin", "dicloxacillin"],
    },
    AllergyClassRule {
        allergen: "sulfa",
        members: &["sulfamethoxazole", "sulfasalazine", "sulfadiazine"],
    },
    AllergyClassRule {
        allergen: "cephalosporin",
        members: &["cephalexin", "cefazolin", "ceftriaxone", "cefuroxime"],
    },
    AllergyClassRule {
        allergen: "nsaid",
        members: &["ibuprofen", "naproxen", "diclofenac", "aspirin"],
    },
];

/// 规则引擎使用的知识库
#[derive(Debug, Clone, Copy)]
pub struct KnowledgeBase {
    pub interactions: &'static [InteractionRule],
    pub therapeutic_classes: &'static [ClassRule],
    pub contraindications: &'static [ContraindicationRule],
    pub dose_limits: &'static [DoseRule],
    pub allergy_classes: &'static [AllergyClassRule],
}

impl KnowledgeBase {
    /// 内置标准知识库
    pub const fn standard() -> Self {
        Self {
            interactions: INTERACTIONS,
            therapeutic_classes: THERAPEUTIC_CLASSES,
            contraindications: CONTRAINDICATIONS,
            dose_limits: DOSE_LIMITS,
            allergy_classes: ALLERGY_CLASSES,
        }
    }

    /// 查找两种药物之间的相互作用，双向匹配
    pub fn find_interaction(
        &self,
        a: &MedicationEntry,
        b: &MedicationEntry,
    ) -> Option<&'static InteractionRule> {
        self.interactions.iter().find(|rule| {
            let (x, y) = rule.drugs;
            (a.matches(x) && b.matches(y)) || (a.matches(y) && b.matches(x))
        })
    }

    /// 药物所属治疗类别，未匹配返回 [`OTHER_CLASS`]
    pub fn therapeutic_class(&self, medication: &MedicationEntry) -> &'static str {
        self.therapeutic_classes
            .iter()
            .find(|rule| medication.matches(rule.drug))
            .map(|rule| rule.class)
            .unwrap_or(OTHER_CLASS)
    }

    pub fn contraindication_for(
        &self,
        medication: &MedicationEntry,
    ) -> Option<&'static ContraindicationRule> {
        self.contraindications
            .iter()
            .find(|rule| medication.matches(rule.drug))
    }

    pub fn dose_limit_for(&self, medication: &MedicationEntry) -> Option<&'static DoseRule> {
        self.dose_limits
            .iter()
            .find(|rule| medication.matches(rule.drug))
    }

    /// 过敏记录是否命中该药物：先直接子串匹配，再查交叉过敏表
    pub fn allergy_matches(&self, allergy: &str, medication: &MedicationEntry) -> bool {
        if medication.matches(allergy) {
            return true;
        }

        self.allergy_classes.iter().any(|rule| {
            terms_overlap(allergy, rule.allergen)
                && rule.members.iter().any(|member| medication.matches(member))
        })
    }
}

impl Default for KnowledgeBase {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interaction_matches_either_order() {
        let kb = KnowledgeBase::standard();
        let warfarin = MedicationEntry::prescribed("Warfarin 5mg", "5");
        let aspirin = MedicationEntry::prescribed("Aspirin 81mg", "81");
        assert!(kb.find_interaction(&warfarin, &aspirin).is_some());
        assert!(kb.find_interaction(&aspirin, &warfarin).is_some());
    }

    #[test]
    fn test_unknown_drug_is_other_class() {
        let kb = KnowledgeBase::standard();
        let med = MedicationEntry::prescribed("Vitamin D3", "1000");
        assert_eq!(kb.therapeutic_class(&med), OTHER_CLASS);
        let med = MedicationEntry::prescribed("Insulin glargine", "10 units");
        assert_eq!(kb.therapeutic_class(&med), "antidiabetic");
    }

    #[test]
    fn test_penicillin_allergy_covers_amoxicillin() {
        let kb = KnowledgeBase::standard();
        let med = MedicationEntry::prescribed("Amoxicillin 500mg", "500");
        assert!(kb.allergy_matches("Penicillin", &med));
        assert!(kb.allergy_matches("amoxicillin", &med));
        assert!(!kb.allergy_matches("Sulfa", &med));
        assert!(!kb.allergy_matches("", &med));
    }

    #[test]
    fn test_dose_limits_are_ordered() {
        for rule in KnowledgeBase::standard().dose_limits {
            assert!(rule.low_mg < rule.high_mg, "{} thresholds inverted", rule.drug);
        }
    }
}
