mod test_support;

use schoolimport::model::EntityType;
use schoolimport::{
    CancelFlag, ImportConfig, ImportRequest, ImportStore, Importer, OutcomeStatus, SqliteStore,
};
use test_support::{
    activity, class_group, count_rows, export, family, student, truck, Fixture,
};

fn run(fx: &Fixture, req: &ImportRequest) -> schoolimport::ImportSummary {
    let config = ImportConfig::default();
    let mut store = SqliteStore::open(&fx.db).expect("open store");
    Importer::new(&config).run(&mut store, req).expect("import run")
}

#[test]
fn second_run_skips_everything_the_first_imported() {
    let xml = export(&[
        ("classGroups", vec![class_group("CG1", "Toddlers")]),
        ("trucks", vec![truck("T1", "ABC-123")]),
        (
            "students",
            vec![
                student("S1", "Smith", "02/03/2015", Some("Smith")),
                student("S2", "Jones", "14/07/2016", None),
            ],
        ),
    ]);
    let fx = Fixture::new("schoolimport-idempotence", &xml);
    let req = ImportRequest::new(&fx.source, &fx.schema);

    let first = run(&fx, &req);
    assert_eq!(first.imported_count, 4);
    assert_eq!(first.skipped_count, 0);
    assert_eq!(first.error_count, 0);
    assert_eq!(count_rows(&fx.db, "families"), 1);

    let second = run(&fx, &req);
    assert_eq!(second.imported_count, 0);
    assert_eq!(second.skipped_count, 4);
    assert!(second
        .outcomes
        .iter()
        .all(|o| o.reason.as_deref() == Some("already imported")));

    assert_eq!(count_rows(&fx.db, "students"), 2);
    assert_eq!(count_rows(&fx.db, "families"), 1);
    assert_eq!(count_rows(&fx.db, "import_runs"), 2);
    assert_eq!(first.source_sha256, second.source_sha256);
}

#[test]
fn three_students_one_each_of_imported_skipped_error() {
    let xml = export(&[(
        "students",
        vec![
            student("S-EXIST", "Garcia", "01/01/2014", None),
            student("S-NEW", "Lopez", "05/09/2015", None),
            student("S-BAD", "Moreno", "", None),
        ],
    )]);
    let seed = export(&[("students", vec![student("S-EXIST", "Garcia", "01/01/2014", None)])]);
    let fx = Fixture::new("schoolimport-three-students", &seed);
    run(&fx, &ImportRequest::new(&fx.source, &fx.schema));

    std::fs::write(&fx.source, xml).expect("rewrite source");
    let summary = run(&fx, &ImportRequest::new(&fx.source, &fx.schema));

    assert_eq!(summary.imported_count, 1);
    assert_eq!(summary.skipped_count, 1);
    assert_eq!(summary.error_count, 1);
    assert_eq!(summary.total(), 3);

    let error = summary
        .outcomes_with(OutcomeStatus::Error)
        .next()
        .expect("error outcome");
    assert_eq!(error.natural_key, "S-BAD");
    assert!(
        error.reason.as_deref().unwrap_or("").contains("dateOfBirth"),
        "{:?}",
        error.reason
    );
    assert_eq!(count_rows(&fx.db, "students"), 2);
}

#[test]
fn counts_always_add_up_to_records_processed() {
    let xml = export(&[
        ("families", vec![family("Smith"), family(" smith "), family("")]),
        (
            "students",
            vec![
                student("S1", "A", "01/01/2015", None),
                student("S1", "A", "01/01/2015", None),
                student("S2", "B", "2015-01-01", None),
                student("S3", "C", "31/02/2015", None),
            ],
        ),
    ]);
    let fx = Fixture::new("schoolimport-conservation", &xml);
    let summary = run(&fx, &ImportRequest::new(&fx.source, &fx.schema));

    assert_eq!(summary.total(), 7);
    assert_eq!(summary.outcomes.len(), 7);
    assert_eq!(summary.imported_count, 2);
    assert_eq!(summary.skipped_count, 2);
    assert_eq!(summary.error_count, 3);
}

#[test]
fn family_names_differing_in_case_share_one_auto_created_family() {
    let xml = export(&[(
        "students",
        vec![
            student("S1", "Smith", "01/01/2015", Some("Smith")),
            student("S2", "Smith", "01/01/2016", Some("smith")),
            student("S3", "Smith", "01/01/2017", Some("SMITH ")),
        ],
    )]);
    let fx = Fixture::new("schoolimport-family-determinism", &xml);
    let summary = run(&fx, &ImportRequest::new(&fx.source, &fx.schema));
    assert_eq!(summary.imported_count, 3);

    let conn = rusqlite::Connection::open(&fx.db).expect("open db");
    let (count, name, auto): (i64, String, bool) = conn
        .query_row(
            "SELECT COUNT(*), MIN(name), MIN(auto_created) FROM families",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .expect("families");
    assert_eq!(count, 1);
    assert_eq!(name, "Smith");
    assert!(auto);

    let linked: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT family_id) FROM students WHERE family_id IS NOT NULL",
            [],
            |r| r.get(0),
        )
        .expect("linked students");
    assert_eq!(linked, 1);
}

#[test]
fn ambiguous_family_links_lowest_id_with_warning() {
    let fx = Fixture::new("schoolimport-family-ambiguous", &export(&[]));
    {
        let store = SqliteStore::open(&fx.db).expect("open store");
        store
            .connection()
            .execute(
                "INSERT INTO families(name, name_key) VALUES('Lee', 'lee'), ('LEE', 'lee')",
                [],
            )
            .expect("seed families");
        assert_eq!(store.counts().expect("counts")[0], ("Family".to_string(), 2));
    }
    let xml = export(&[("students", vec![student("S1", "Lee", "01/01/2015", Some("lee"))])]);
    std::fs::write(&fx.source, xml).expect("write source");

    let summary = run(&fx, &ImportRequest::new(&fx.source, &fx.schema));
    assert_eq!(summary.imported_count, 1);
    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("linked to 1"), "{:?}", outcome.warnings);

    let family_id: i64 = rusqlite::Connection::open(&fx.db)
        .expect("open db")
        .query_row("SELECT family_id FROM students WHERE code = 'S1'", [], |r| r.get(0))
        .expect("family id");
    assert_eq!(family_id, 1);
}

#[test]
fn students_link_class_groups_and_trucks_from_the_same_run() {
    let xml = export(&[
        ("classGroups", vec![class_group("CG1", "Toddlers")]),
        ("trucks", vec![truck("T1", "ABC-123")]),
        (
            "students",
            vec![
                "<student><code>S1</code><firstName>Ana</firstName><lastName>Ruiz</lastName>\
                 <dateOfBirth>02/03/2015</dateOfBirth><classGroup>CG1</classGroup><truck>T1</truck>\
                 <monthlyFee>120,50</monthlyFee></student>"
                    .to_string(),
            ],
        ),
    ]);
    let fx = Fixture::new("schoolimport-links", &xml);
    let summary = run(&fx, &ImportRequest::new(&fx.source, &fx.schema));
    assert_eq!(summary.imported_count, 3);
    assert!(summary.outcomes.iter().all(|o| o.warnings.is_empty()));

    let conn = rusqlite::Connection::open(&fx.db).expect("open db");
    let (cg, tr, fee): (Option<i64>, Option<i64>, f64) = conn
        .query_row(
            "SELECT class_group_id, truck_id, monthly_fee FROM students WHERE code = 'S1'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .expect("student row");
    assert_eq!(cg, Some(1));
    assert_eq!(tr, Some(1));
    assert_eq!(fee, 120.5);
}

#[test]
fn every_created_field_is_change_logged() {
    let xml = export(&[("students", vec![student("S1", "Smith", "01/01/2015", Some("Smith"))])]);
    let fx = Fixture::new("schoolimport-change-log", &xml);
    run(&fx, &ImportRequest::new(&fx.source, &fx.schema));

    let conn = rusqlite::Connection::open(&fx.db).expect("open db");
    let mut stmt = conn
        .prepare("SELECT DISTINCT entity_type FROM audit_log ORDER BY entity_type")
        .expect("prepare");
    let types: Vec<String> = stmt
        .query_map([], |r| r.get(0))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows");
    assert_eq!(types, vec!["Family".to_string(), "Student".to_string()]);

    let dob: String = conn
        .query_row(
            "SELECT new_value FROM audit_log WHERE entity_type = 'Student' AND field = 'dateOfBirth'",
            [],
            |r| r.get(0),
        )
        .expect("dob entry");
    assert_eq!(dob, "2015-01-01");
    let changed_by: String = conn
        .query_row("SELECT DISTINCT changed_by FROM audit_log", [], |r| r.get(0))
        .expect("actor");
    assert_eq!(changed_by, "legacy-import");
}

#[test]
fn outcome_log_appends_and_summary_overwrites() {
    let xml = export(&[(
        "students",
        vec![
            student("S1", "Smith", "01/01/2015", None),
            student("S2", "Smith", "bad", None),
        ],
    )]);
    let fx = Fixture::new("schoolimport-output-files", &xml);
    let audit = fx.path("outcomes.log");
    let summary_path = fx.path("summary.txt");
    let req = ImportRequest::new(&fx.source, &fx.schema)
        .audit_log(&audit)
        .summary(&summary_path);

    let first = run(&fx, &req);
    assert_eq!(first.audit_log_path.as_deref(), Some(audit.as_path()));
    run(&fx, &req);

    let log = std::fs::read_to_string(&audit).expect("read outcome log");
    assert_eq!(log.lines().filter(|l| l.starts_with("# run ")).count(), 2);
    let lines: Vec<&str> = log.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("Student\tS1\tImported"));
    assert!(lines[1].starts_with("Student\tS2\tError\t"));
    assert_eq!(lines[2], "Student\tS1\tSkipped\talready imported");

    let text = std::fs::read_to_string(&summary_path).expect("read summary");
    assert!(text.contains("Imported: 0"));
    assert!(text.contains("Skipped:  1"));
    assert!(text.contains("Errors:   1"));
    assert_eq!(text.matches("Legacy import run").count(), 1);
}

#[test]
fn cancelled_run_stops_between_records() {
    let xml = export(&[(
        "students",
        vec![
            student("S1", "A", "01/01/2015", None),
            student("S2", "B", "01/01/2015", None),
        ],
    )]);
    let fx = Fixture::new("schoolimport-cancel", &xml);
    let flag = CancelFlag::new();
    flag.cancel();
    let summary = run(
        &fx,
        &ImportRequest::new(&fx.source, &fx.schema).cancel_flag(flag),
    );
    assert!(summary.cancelled);
    assert_eq!(summary.total(), 0);
    assert_eq!(count_rows(&fx.db, "students"), 0);
    assert_eq!(count_rows(&fx.db, "import_runs"), 1);
}

#[test]
fn failed_record_leaves_no_partial_rows() {
    let fx = Fixture::new("schoolimport-rollback", &export(&[]));
    let mut config = ImportConfig::default();
    // Families are not audited, so a student whose family must be created fails
    // as a whole, and the family insert is rolled back with it.
    config.audited = schoolimport::config::EntityWhitelist::only([EntityType::Student]);
    let xml = export(&[(
        "students",
        vec![
            student("S1", "Smith", "01/01/2015", Some("Smith")),
            student("S2", "Jones", "01/01/2015", None),
        ],
    )]);
    std::fs::write(&fx.source, xml).expect("write source");

    let mut store = SqliteStore::open(&fx.db).expect("open store");
    let summary = Importer::new(&config)
        .run(&mut store, &ImportRequest::new(&fx.source, &fx.schema))
        .expect("run");
    assert_eq!(summary.error_count, 1);
    assert_eq!(summary.imported_count, 1);
    assert!(summary.outcomes[0]
        .reason
        .as_deref()
        .unwrap_or("")
        .contains("not enabled for auditing"));
    drop(store);

    assert_eq!(count_rows(&fx.db, "families"), 0);
    assert_eq!(count_rows(&fx.db, "students"), 1);
}

#[test]
fn activities_link_class_groups_and_check_cost() {
    let xml = export(&[
        ("classGroups", vec![class_group("CG1", "Toddlers")]),
        (
            "activities",
            vec![
                activity("A1", "12/05/2024", Some("15.50"), Some("CG1")),
                activity("A2", "13/05/2024", None, None),
                activity("A3", "14/05/2024", Some("-5"), Some("CG1")),
            ],
        ),
    ]);
    let fx = Fixture::new("schoolimport-activities", &xml);
    let summary = run(&fx, &ImportRequest::new(&fx.source, &fx.schema));

    assert_eq!(summary.imported_count, 3);
    assert_eq!(summary.error_count, 1);
    let bad = summary
        .outcomes
        .iter()
        .find(|o| o.status == OutcomeStatus::Error)
        .expect("error outcome");
    assert_eq!(bad.kind, "Activity");
    assert_eq!(bad.natural_key, "A3");
    assert!(bad.reason.as_deref().unwrap_or_default().contains("cost"), "{bad:?}");

    let conn = rusqlite::Connection::open(&fx.db).expect("open db");
    let (cost, group, held_on): (f64, i64, String) = conn
        .query_row(
            "SELECT a.cost, c.id, a.held_on FROM activities a JOIN class_groups c ON c.id = a.class_group_id WHERE a.code = 'A1'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .expect("linked activity");
    assert_eq!(cost, 15.5);
    assert_eq!(group, 1);
    assert_eq!(held_on, "2024-05-12");

    let (cost, group): (f64, Option<i64>) = conn
        .query_row(
            "SELECT cost, class_group_id FROM activities WHERE code = 'A2'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("default cost");
    assert_eq!(cost, 0.0);
    assert_eq!(group, None);
    assert_eq!(count_rows(&fx.db, "activities"), 2);
}

#[test]
fn unwritable_report_files_do_not_undo_a_committed_run() {
    let xml = export(&[("students", vec![student("S1", "Smith", "02/03/2015", None)])]);
    let fx = Fixture::new("schoolimport-report-failure", &xml);
    let audit = fx.path("outcomes-dir");
    let summary_path = fx.path("summary-dir");
    std::fs::create_dir_all(&audit).expect("audit dir");
    std::fs::create_dir_all(&summary_path).expect("summary dir");

    let req = ImportRequest::new(&fx.source, &fx.schema)
        .audit_log(&audit)
        .summary(&summary_path);
    let summary = run(&fx, &req);

    assert_eq!(summary.imported_count, 1);
    assert!(summary.audit_log_path.is_none());
    assert!(summary.summary_path.is_none());
    assert_eq!(count_rows(&fx.db, "students"), 1);
    assert_eq!(count_rows(&fx.db, "import_runs"), 1);
}
