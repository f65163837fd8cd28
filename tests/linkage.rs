use std::collections::BTreeSet;

use record_linker::io::{read_combined, read_ground_truth, write_predictions};
use record_linker::{
    estimate_prior_from_deterministic_rules, evaluate_links, BlockingRule, CollectionInput,
    GroundTruth, GroundTruthColumns, LinkageError, Linker, LinkerSettings, RecordStore, Row,
};

const SETTINGS: &str = r#"
blocking_rules = [["dob"]]

[[comparisons]]
attribute = "given_name"

[[comparisons]]
attribute = "surname"
levels = [{ kind = "exact" }, { kind = "jaro_winkler", threshold = 0.88 }]

[[comparisons]]
attribute = "dob"

[[comparisons]]
attribute = "postcode"

[training]
u_sample_size = 1000
em_rules = [["dob"]]

[prediction]
threshold = 0.5
"#;

const GIVEN: [&str; 20] = [
    "amelia", "benjamin", "charlotte", "daniel", "eleanor", "frederick", "georgia", "harrison",
    "isabella", "jonathan", "katherine", "leonardo", "margaret", "nathaniel", "olivia", "patrick",
    "rosalind", "sebastian", "theodora", "vincent",
];

const SURNAME: [&str; 15] = [
    "abbott", "barker", "carver", "dalton", "ellison", "fletcher", "garrett", "hughes", "irwin",
    "jennings", "kendall", "lambert", "mercer", "norris", "osborne",
];

/// Surnames recorded with a one-letter slip on the right-hand side.
const TYPOS: [(&str, &str); 5] = [
    ("thompson", "thompsen"),
    ("richardson", "richardsen"),
    ("williamson", "wiliamson"),
    ("henderson", "hendersen"),
    ("patterson", "pattersen"),
];

const LEFT_LETTERS: &[u8] = b"abcdefghij";
const RIGHT_LETTERS: &[u8] = b"klmnopqrst";

/// A made-up name unique to `i`. Left and right alphabets share no letter, so
/// strings from opposite sides only agree where a record reuses the other
/// side's name on purpose.
fn code(i: usize, alphabet: &[u8]) -> String {
    let letter = |d: usize| alphabet[d % 10] as char;
    [
        letter(i / 10),
        letter(i % 10),
        letter(i * 7 + 3),
        letter(i * 3 + 1),
    ]
    .iter()
    .collect()
}

fn person(id: String, given: String, surname: String, dob: String, postcode: String) -> Row {
    Row::new()
        .with("unique_id", id)
        .with("given_name", given)
        .with("surname", surname)
        .with("dob", dob)
        .with("postcode", postcode)
}

/// 50 records per hospital. Records 0..20 are the same people on both sides
/// (the last five with a surname typo); 20..50 are different people who happen
/// to share a date of birth with their counterpart. Of those strangers, 20..30
/// also share a given name and 30..35 live at the same postcode.
fn hospitals() -> (Vec<Row>, Vec<Row>) {
    let mut left = Vec::new();
    let mut right = Vec::new();
    for i in 0..50 {
        let dob = format!("19{:02}-{:02}-{:02}", 50 + i, 1 + i % 12, 1 + i % 28);
        if i < 20 {
            let (l_surname, r_surname) = if i < 15 {
                (SURNAME[i], SURNAME[i])
            } else {
                TYPOS[i - 15]
            };
            let postcode = format!("PC{i:02}");
            left.push(person(
                format!("a-{i}"),
                GIVEN[i].to_string(),
                l_surname.to_string(),
                dob.clone(),
                postcode.clone(),
            ));
            right.push(person(
                format!("b-{i}"),
                GIVEN[i].to_string(),
                r_surname.to_string(),
                dob,
                postcode,
            ));
        } else {
            let reversed = |s: String| s.chars().rev().collect::<String>();
            let right_given = if i < 30 {
                code(i, LEFT_LETTERS)
            } else {
                code(i, RIGHT_LETTERS)
            };
            let right_postcode = if (30..35).contains(&i) {
                format!("L{i}")
            } else {
                format!("R{i}")
            };
            left.push(person(
                format!("a-{i}"),
                code(i, LEFT_LETTERS),
                reversed(code(i, LEFT_LETTERS)),
                dob.clone(),
                format!("L{i}"),
            ));
            right.push(person(
                format!("b-{i}"),
                right_given,
                reversed(code(i, RIGHT_LETTERS)),
                dob,
                right_postcode,
            ));
        }
    }
    (left, right)
}

fn truth() -> GroundTruth {
    GroundTruth::from_pairs((0..20).map(|i| (format!("a-{i}"), format!("b-{i}"))))
}

fn store_from(settings: &LinkerSettings, left: Vec<Row>, right: Vec<Row>) -> RecordStore {
    RecordStore::link_only(
        settings.schema(),
        &settings.unique_id_column,
        CollectionInput::new("apollo", left),
        CollectionInput::new("narayana", right),
    )
    .unwrap()
}

#[test]
fn test_end_to_end_links_every_true_match() {
    let settings = LinkerSettings::from_toml(SETTINGS).unwrap();
    let (left, right) = hospitals();
    let store = store_from(&settings, left, right);
    let linker = Linker::new(&store, &settings).unwrap();

    let report = linker.train().unwrap();
    assert_eq!(report.rounds.len(), 1);
    let round = &report.rounds[0].outcome;
    assert_eq!(round.training_pairs, 50);
    assert_eq!(
        round.trained_comparisons,
        vec!["given_name", "surname", "postcode"]
    );
    // 20 of the 50 DOB-blocked pairs are matches.
    let prior = report.parameters.prior();
    assert!((0.3..0.5).contains(&prior), "prior {prior}");
    assert!(report.parameters.m_values(0)[0] > 0.99);

    let candidates = linker.candidates().unwrap();
    assert_eq!(candidates.pairs.len(), 50);
    assert_eq!(candidates.stats[0].new_pairs, 50);
    assert!(candidates.warnings.is_empty());

    let links = linker.predict(&candidates.pairs, &report.parameters).unwrap();
    let eval = evaluate_links(&links, &truth());
    assert_eq!(eval.true_positives.len(), 20);
    assert!(eval.false_positives.is_empty(), "{:?}", eval.false_positives);
    // Strangers agreeing on one identifier still score well below the threshold.
    let stranger = candidates
        .pairs
        .iter()
        .find(|p| store.left().id(p.left) == "a-25")
        .unwrap();
    let p = record_linker::score(&stranger.vector, &report.parameters);
    assert!(p < 0.5, "a-25/b-25 scored {p}");
    assert!((eval.precision - 1.0).abs() < 1e-12);
    assert!((eval.recall - 1.0).abs() < 1e-12);

    let typo = links.iter().find(|l| l.left_id == "a-15").unwrap();
    assert_eq!(typo.right_id, "b-15");
    assert_eq!(typo.comparisons[1].label, "jaro_winkler>=0.88");
    assert!(links.iter().all(|l| l.match_probability >= 0.5));
}

#[test]
fn test_predictions_do_not_depend_on_record_order() {
    let settings = LinkerSettings::from_toml(SETTINGS).unwrap();
    let (left, right) = hospitals();

    let run = |left: Vec<Row>, right: Vec<Row>| {
        let store = store_from(&settings, left, right);
        let linker = Linker::new(&store, &settings).unwrap();
        let params = linker.train().unwrap().parameters;
        let candidates = linker.candidates().unwrap();
        linker
            .predict(&candidates.pairs, &params)
            .unwrap()
            .into_iter()
            .map(|l| (l.left_id, l.right_id))
            .collect::<BTreeSet<_>>()
    };

    let forward = run(left.clone(), right.clone());
    let reversed = run(
        left.into_iter().rev().collect(),
        right.into_iter().rev().collect(),
    );
    assert_eq!(forward, reversed);
    assert_eq!(forward.len(), 20);
}

#[test]
fn test_deterministic_rule_prior() {
    let settings = LinkerSettings::from_toml(SETTINGS).unwrap();
    let (left, right) = hospitals();
    let store = store_from(&settings, left, right);

    // 20 true matches plus 10 shared given names and 5 shared postcodes; the
    // 20 pairs found by both rules count once.
    let rules = [BlockingRule::on(["given_name"]), BlockingRule::on(["postcode"])];
    let prior =
        estimate_prior_from_deterministic_rules(&store, &rules, 1.0, &settings.blocking).unwrap();
    assert!((prior - 35.0 / 2500.0).abs() < 1e-12);
}

#[test]
fn test_combined_csv_and_predictions_csv() {
    let settings = LinkerSettings::from_toml(SETTINGS).unwrap();
    let (left, right) = hospitals();

    let mut csv = String::from("unique_id,source_dataset,given_name,surname,dob,postcode\n");
    for (tag, rows) in [("apollo", &left), ("narayana", &right)] {
        for row in rows.iter() {
            let cell = |name: &str| {
                row.fields()
                    .iter()
                    .find(|(n, _)| n == name)
                    .and_then(|(_, v)| v.as_ref())
                    .map(|v| v.as_text().into_owned())
                    .unwrap_or_default()
            };
            csv.push_str(&format!(
                "{},{tag},{},{},{},{}\n",
                cell("unique_id"),
                cell("given_name"),
                cell("surname"),
                cell("dob"),
                cell("postcode")
            ));
        }
    }

    let (l, r) = read_combined(
        csv.as_bytes(),
        &settings.schema(),
        &settings.unique_id_column,
        &settings.source_column,
    )
    .unwrap();
    assert_eq!((l.source.as_str(), r.source.as_str()), ("apollo", "narayana"));
    let store = RecordStore::link_only(settings.schema(), &settings.unique_id_column, l, r).unwrap();
    assert_eq!(store.left().len(), 50);
    assert_eq!(store.right().len(), 50);

    let linker = Linker::new(&store, &settings).unwrap();
    let params = linker.train().unwrap().parameters;
    let candidates = linker.candidates().unwrap();
    let links = linker.predict(&candidates.pairs, &params).unwrap();

    let mut out = Vec::new();
    write_predictions(&mut out, linker.comparisons(), &links).unwrap();
    let mut reader = csv::Reader::from_reader(out.as_slice());
    let headers = reader.headers().unwrap().clone();
    assert_eq!(&headers[0], "unique_id_l");
    assert_eq!(&headers[5], "gamma_given_name");
    assert_eq!(&headers[6], "bf_given_name");
    assert_eq!(headers.len(), 5 + 2 * 4);
    assert_eq!(reader.records().count(), links.len());
}

#[test]
fn test_ground_truth_columns_follow_names() {
    // Columns appear in the opposite order to their roles.
    let data = "\
,rec_id_2,rec_id_1
0,b-1,a-1
1,b-2,a-2
2,b-3,a-3
";
    let truth = read_ground_truth(
        data.as_bytes(),
        &GroundTruthColumns::new("rec_id_1", "rec_id_2"),
    )
    .unwrap();
    assert_eq!(truth.len(), 3);
    assert!(truth.contains("a-1", "b-1"));

    let predictions = vec![("a-1", "b-1"), ("a-2", "b-2"), ("a-3", "b-5")];
    let eval = record_linker::evaluate(predictions, &truth);
    assert!((eval.precision - 2.0 / 3.0).abs() < 1e-12);
    assert!((eval.recall - 2.0 / 3.0).abs() < 1e-12);
}

#[test]
fn test_duplicate_ids_reject_the_collection() {
    let settings = LinkerSettings::from_toml(SETTINGS).unwrap();
    let (mut left, right) = hospitals();
    left.push(left[0].clone());

    let err = RecordStore::link_only(
        settings.schema(),
        &settings.unique_id_column,
        CollectionInput::new("apollo", left),
        CollectionInput::new("narayana", right),
    )
    .unwrap_err();
    match err {
        LinkageError::DataQuality {
            collection,
            duplicate_ids,
            ..
        } => {
            assert_eq!(collection, "apollo");
            assert_eq!(duplicate_ids, vec!["a-0"]);
        }
        other => panic!("unexpected error: {other}"),
    }
}
