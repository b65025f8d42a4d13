use serde::Serialize;

pub const COMPONENT_COUNT: usize = 8;

/// One of the eight individually-scored inputs that sum to a student's
/// subject total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeComponent {
    Evaluation1,
    Evaluation2,
    Evaluation3,
    Evaluation4,
    MonthlyExam,
    Notebook,
    Attendance,
    Behavior,
}

impl GradeComponent {
    pub const ALL: [GradeComponent; COMPONENT_COUNT] = [
        GradeComponent::Evaluation1,
        GradeComponent::Evaluation2,
        GradeComponent::Evaluation3,
        GradeComponent::Evaluation4,
        GradeComponent::MonthlyExam,
        GradeComponent::Notebook,
        GradeComponent::Attendance,
        GradeComponent::Behavior,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "evaluation_1" => Some(Self::Evaluation1),
            "evaluation_2" => Some(Self::Evaluation2),
            "evaluation_3" => Some(Self::Evaluation3),
            "evaluation_4" => Some(Self::Evaluation4),
            "monthly_exam" => Some(Self::MonthlyExam),
            "notebook" => Some(Self::Notebook),
            "attendance" => Some(Self::Attendance),
            "behavior" => Some(Self::Behavior),
            _ => None,
        }
    }

    /// Column name in the grades table; also the wire name.
    pub fn column(self) -> &'static str {
        match self {
            Self::Evaluation1 => "evaluation_1",
            Self::Evaluation2 => "evaluation_2",
            Self::Evaluation3 => "evaluation_3",
            Self::Evaluation4 => "evaluation_4",
            Self::MonthlyExam => "monthly_exam",
            Self::Notebook => "notebook",
            Self::Attendance => "attendance",
            Self::Behavior => "behavior",
        }
    }

    /// Matching maximum-point column in the grade_schema table.
    pub fn max_column(self) -> &'static str {
        match self {
            Self::Evaluation1 => "evaluation_1_max",
            Self::Evaluation2 => "evaluation_2_max",
            Self::Evaluation3 => "evaluation_3_max",
            Self::Evaluation4 => "evaluation_4_max",
            Self::MonthlyExam => "monthly_exam_max",
            Self::Notebook => "notebook_max",
            Self::Attendance => "attendance_max",
            Self::Behavior => "behavior_max",
        }
    }

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|c| *c == self).unwrap_or(0)
    }
}

/// The ledger total: sum of the components that are set, unset treated as
/// zero. This is the only place totals are computed; the storage layer
/// never derives them.
pub fn ledger_total(components: &[Option<f64>; COMPONENT_COUNT]) -> f64 {
    components.iter().flatten().sum()
}

/// present / (present + absent) * 100, one decimal. Zero records is 0.0,
/// never NaN.
pub fn presence_percentage(present: i64, absent: i64) -> f64 {
    let total = present + absent;
    if total <= 0 {
        return 0.0;
    }
    let pct = (present as f64) / (total as f64) * 100.0;
    (pct * 10.0).round() / 10.0
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if leap => 29,
        2 => 28,
        _ => 30,
    }
}

/// Inclusive [first day 00:00:00, last day 23:59:59] bounds for one
/// calendar month, in the same UTC second-precision format the storage
/// layer stamps rows with. None for an out-of-range month.
pub fn month_window(year: i32, month: u32) -> Option<(String, String)> {
    if !(1..=12).contains(&month) {
        return None;
    }
    let last = days_in_month(year, month);
    let start = format!("{:04}-{:02}-01T00:00:00", year, month);
    let end = format!("{:04}-{:02}-{:02}T23:59:59", year, month, last);
    Some((start, end))
}

/// Inclusive date-only bounds for the same window, for columns that hold
/// plain ISO dates (attendance).
pub fn month_date_range(year: i32, month: u32) -> Option<(String, String)> {
    if !(1..=12).contains(&month) {
        return None;
    }
    let last = days_in_month(year, month);
    Some((
        format!("{:04}-{:02}-01", year, month),
        format!("{:04}-{:02}-{:02}", year, month, last),
    ))
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Cell rendering shared by the report table model and the CSV export so
/// the two can never disagree. Unset components are empty fields.
pub fn fmt_component(v: Option<f64>) -> String {
    match v {
        None => String::new(),
        Some(n) => fmt_number(n),
    }
}

pub fn fmt_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub student_id: String,
    pub student_name: String,
    pub present_days: i64,
    pub absent_days: i64,
    pub presence_percent: f64,
}
