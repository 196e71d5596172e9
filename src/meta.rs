//! Sample metadata: cohorts, disease codes, group keys and pair categories.
//!
//! The metadata table is loaded once per run and is read-only afterwards, so
//! it can be shared freely across worker threads. The cohort and disease
//! conversion tables are fixed enumerations expressed as `match` arms, not
//! runtime lookup maps.

use std::collections::HashMap;

/// The fixed cohort enumeration. The order defines column positions in the
/// cohort contingency table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Cohort {
    Rcdi,
    Ibs,
    Luad,
    Mel,
}

impl Cohort {
    pub const ALL: [Cohort; 4] = [Cohort::Rcdi, Cohort::Ibs, Cohort::Luad, Cohort::Mel];

    /// Column index in the cohort contingency table.
    pub fn index(self) -> usize {
        match self {
            Cohort::Rcdi => 0,
            Cohort::Ibs => 1,
            Cohort::Luad => 2,
            Cohort::Mel => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Cohort::Rcdi => "rCDI",
            Cohort::Ibs => "IBS",
            Cohort::Luad => "LUAD",
            Cohort::Mel => "MEL",
        }
    }

    pub fn parse(s: &str) -> Option<Cohort> {
        match s {
            "rCDI" => Some(Cohort::Rcdi),
            "IBS" => Some(Cohort::Ibs),
            "LUAD" => Some(Cohort::Luad),
            "MEL" => Some(Cohort::Mel),
            _ => None,
        }
    }
}

/// Disease type as recorded in the metadata table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiseaseType {
    Healthy,
    BeforeFmt,
    Responder,
    NonResponder,
}

impl DiseaseType {
    pub fn parse(s: &str) -> Option<DiseaseType> {
        match s {
            "healthy" => Some(DiseaseType::Healthy),
            "before_FMT" => Some(DiseaseType::BeforeFmt),
            "responder" => Some(DiseaseType::Responder),
            "non-responder" => Some(DiseaseType::NonResponder),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DiseaseType::Healthy => "healthy",
            DiseaseType::BeforeFmt => "before_FMT",
            DiseaseType::Responder => "responder",
            DiseaseType::NonResponder => "non-responder",
        }
    }

    /// The binary disease conversion: before_FMT and non-responder count as
    /// diseased, healthy and responder as healthy.
    pub fn code(self) -> DiseaseCode {
        match self {
            DiseaseType::Healthy | DiseaseType::Responder => DiseaseCode::Healthy,
            DiseaseType::BeforeFmt | DiseaseType::NonResponder => DiseaseCode::Diseased,
        }
    }
}

/// Binary disease code used for counting. The order defines column positions
/// in the disease contingency table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiseaseCode {
    Healthy,
    Diseased,
}

impl DiseaseCode {
    pub fn index(self) -> usize {
        match self {
            DiseaseCode::Healthy => 0,
            DiseaseCode::Diseased => 1,
        }
    }
}

/// One row of the metadata table.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleRecord {
    pub cohort: Cohort,
    pub individual: String,
    pub day: i64,
    pub disease: DiseaseType,
    pub donor: Option<String>,
}

impl SampleRecord {
    /// The unit of statistical counting: multiple tips sharing one group key
    /// count once per contingency-table cell.
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            cohort: self.cohort,
            individual: self.individual.clone(),
            code: self.disease.code(),
        }
    }
}

/// Metadata group key (cohort, individual, disease code).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub cohort: Cohort,
    pub individual: String,
    pub code: DiseaseCode,
}

/// Read-only metadata table keyed by sample id.
#[derive(Clone, Debug, Default)]
pub struct SampleMeta {
    records: HashMap<String, SampleRecord>,
}

impl SampleMeta {
    /// Build a table from (sample id, record) pairs; the first occurrence of
    /// a duplicated id wins.
    pub fn from_records(rows: impl IntoIterator<Item = (String, SampleRecord)>) -> Self {
        let mut records = HashMap::new();
        for (id, record) in rows {
            records.entry(id).or_insert(record);
        }
        SampleMeta { records }
    }

    pub fn get(&self, sample_id: &str) -> Option<&SampleRecord> {
        self.records.get(sample_id)
    }

    pub fn contains(&self, sample_id: &str) -> bool {
        self.records.contains_key(sample_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SampleRecord)> {
        self.records.iter()
    }

    /// Table restricted to samples taken after FMT (and healthy controls),
    /// used by the persistence analysis.
    pub fn without_before_fmt(&self) -> SampleMeta {
        SampleMeta {
            records: self
                .records
                .iter()
                .filter(|(_, r)| r.disease != DiseaseType::BeforeFmt)
                .map(|(id, r)| (id.clone(), r.clone()))
                .collect(),
        }
    }
}

/// Category assigned to a sample pair based on metadata alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairCategory {
    HealthySameIndividual,
    HealthyDifferentIndividuals,
    SamePatients,
    DifferentPatientsSameDonor,
    DifferentPatients,
    BeforeAfterFmtSameResponder,
    BeforeAfterFmtSameNonResponder,
    PatientVsItsDonorResponder,
    PatientVsItsDonorNonResponder,
    Other,
}

impl PairCategory {
    pub fn label(self) -> &'static str {
        match self {
            PairCategory::HealthySameIndividual => "healthy_same_individual",
            PairCategory::HealthyDifferentIndividuals => "healthy_different_individuals",
            PairCategory::SamePatients => "same_patients",
            PairCategory::DifferentPatientsSameDonor => "different_patients_same_donor",
            PairCategory::DifferentPatients => "different_patients",
            PairCategory::BeforeAfterFmtSameResponder => "before_after_FMT_same_responder",
            PairCategory::BeforeAfterFmtSameNonResponder => "before_after_FMT_same_non_responder",
            PairCategory::PatientVsItsDonorResponder => "patient_vs_its_donor_responder",
            PairCategory::PatientVsItsDonorNonResponder => "patient_vs_its_donor_non_responder",
            PairCategory::Other => "other",
        }
    }
}

/// Categorize a sample pair from its two metadata rows.
///
/// Invariant to argument order. When exactly one row is healthy and the other
/// is a patient, the patient/donor comparison always treats the non-healthy
/// row as the patient, regardless of which argument it arrived in.
pub fn categorize_pair(a: &SampleRecord, b: &SampleRecord) -> PairCategory {
    use DiseaseType::*;

    if a.disease == Healthy && b.disease == Healthy {
        if a.individual == b.individual {
            return PairCategory::HealthySameIndividual;
        }
        return PairCategory::HealthyDifferentIndividuals;
    }

    if a.disease != Healthy && b.disease != Healthy {
        if a.disease != BeforeFmt && b.disease != BeforeFmt {
            if a.individual == b.individual {
                return PairCategory::SamePatients;
            }
            if a.donor.is_some() && a.donor == b.donor {
                return PairCategory::DifferentPatientsSameDonor;
            }
            return PairCategory::DifferentPatients;
        }
        // Exactly one side is before_FMT: a before/after pair within one
        // individual, labeled by the post-FMT response.
        if a.individual == b.individual {
            if a.disease == Responder || b.disease == Responder {
                return PairCategory::BeforeAfterFmtSameResponder;
            }
            if a.disease == NonResponder || b.disease == NonResponder {
                return PairCategory::BeforeAfterFmtSameNonResponder;
            }
        }
        return PairCategory::Other;
    }

    // One healthy, one patient. The non-healthy row is the patient.
    let (patient, healthy) = if a.disease != Healthy { (a, b) } else { (b, a) };
    if patient.donor.as_deref() == Some(healthy.individual.as_str())
        && patient.disease != BeforeFmt
    {
        if patient.disease == Responder {
            return PairCategory::PatientVsItsDonorResponder;
        }
        if patient.disease == NonResponder {
            return PairCategory::PatientVsItsDonorNonResponder;
        }
    }

    PairCategory::Other
}
