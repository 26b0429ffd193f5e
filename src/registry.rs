/*!
Which table and columns store each kind of user.

A [`Binding`] ties a [`Kind`] to the discriminator string written in the
base table's `tipo_utente` column, the secondary table holding that kind's
own fields, and the ordered list of [`Column`]s mapping those fields to and
from storage [`Value`]s. Adding a kind of user means adding a binding here.
*/
use crate::store::{ColumnType, DbError, Value};
use crate::user::*;

pub const BASE_TABLE: &str = "utenti";
pub const DISCRIMINATOR_COLUMN: &str = "tipo_utente";

/// Base-table columns read back on lookup, in select order.
pub const BASE_COLUMNS: &[(&str, ColumnType)] = &[
    ("id",              ColumnType::BigInt),
    ("data_iscrizione", ColumnType::Timestamp),
    ("login",           ColumnType::Text),
    ("password",        ColumnType::Text),
    ("email",           ColumnType::Text),
    ("nome",            ColumnType::Text),
    ("cognome",         ColumnType::Text),
    ("tipo_utente",     ColumnType::Text),
];

/// Columns the database fills in on insert into the base table.
pub const BASE_GENERATED: &[(&str, ColumnType)] = &[
    ("id",              ColumnType::BigInt),
    ("data_iscrizione", ColumnType::Timestamp),
];

/// Maps one field of one kind of user to one column.
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    /// `None` if handed a user of another kind.
    pub get: fn(&User) -> Option<Value>,
    /// Does nothing to a user of another kind.
    pub set: fn(&mut User, Value) -> Result<(), DbError>,
}

pub struct Binding {
    pub kind: Kind,
    pub discriminator: &'static str,
    pub table: &'static str,
    /// Secondary-table column holding the base row's `id`.
    pub key: &'static str,
    pub columns: &'static [Column],
    /// A user of this kind with `base` and blank kind-specific fields.
    pub blank: fn(BaseUser) -> User,
}

impl Binding {
    /// Column/value pairs for inserting `u` into this binding's table,
    /// key column first.
    pub fn values(&self, id: i64, u: &User) -> Result<Vec<(&'static str, Value)>, DbError> {
        let mut v = Vec::with_capacity(self.columns.len() + 1);
        v.push((self.key, Value::BigInt(id)));
        for col in self.columns.iter() {
            match (col.get)(u) {
                Some(x) => { v.push((col.name, x)); },
                None => { return Err(DbError::UnsupportedVariant(u.kind())); },
            }
        }
        Ok(v)
    }

    /// The (name, type) list to select from this binding's table.
    pub fn fields(&self) -> Vec<(&'static str, ColumnType)> {
        self.columns.iter().map(|c| (c.name, c.ty)).collect()
    }
}

/// Generates a getter/setter pair for a plain field of one `User` variant.
macro_rules! column {
    ($name:literal, $variant:ident . $field:ident, Text) => {
        Column {
            name: $name,
            ty: ColumnType::Text,
            get: {
                fn get(u: &User) -> Option<Value> {
                    match u {
                        User::$variant(x) => Some(Value::Text(x.$field.clone())),
                        _ => None,
                    }
                }
                get
            },
            set: {
                fn set(u: &mut User, v: Value) -> Result<(), DbError> {
                    if let User::$variant(x) = u {
                        x.$field = v.into_text()?;
                    }
                    Ok(())
                }
                set
            },
        }
    };
    ($name:literal, $variant:ident . $field:ident, BigInt) => {
        Column {
            name: $name,
            ty: ColumnType::BigInt,
            get: {
                fn get(u: &User) -> Option<Value> {
                    match u {
                        User::$variant(x) => Some(Value::BigInt(x.$field)),
                        _ => None,
                    }
                }
                get
            },
            set: {
                fn set(u: &mut User, v: Value) -> Result<(), DbError> {
                    if let User::$variant(x) = u {
                        x.$field = v.into_bigint()?;
                    }
                    Ok(())
                }
                set
            },
        }
    };
    ($name:literal, $variant:ident . $field:ident, Date) => {
        Column {
            name: $name,
            ty: ColumnType::Date,
            get: {
                fn get(u: &User) -> Option<Value> {
                    match u {
                        User::$variant(x) => Some(Value::Date(x.$field)),
                        _ => None,
                    }
                }
                get
            },
            set: {
                fn set(u: &mut User, v: Value) -> Result<(), DbError> {
                    if let User::$variant(x) = u {
                        x.$field = v.into_date()?;
                    }
                    Ok(())
                }
                set
            },
        }
    };
}

fn get_role(u: &User) -> Option<Value> {
    match u {
        User::Operator(o) => Some(Value::Text(o.role.to_string())),
        _ => None,
    }
}

fn set_role(u: &mut User, v: Value) -> Result<(), DbError> {
    if let User::Operator(o) = u {
        o.role = OperatorRole::decode_lenient(&v.into_text()?);
    }
    Ok(())
}

fn get_agreement(u: &User) -> Option<Value> {
    match u {
        User::Company(c) => Some(Value::Text(c.agreement.to_string())),
        _ => None,
    }
}

fn set_agreement(u: &mut User, v: Value) -> Result<(), DbError> {
    if let User::Company(c) = u {
        c.agreement = v.into_text()?.parse()
            .map_err(DbError::DataIntegrity)?;
    }
    Ok(())
}

// Blank fields are always overwritten during hydration; the placeholder
// enum values and date never survive a successful read.

fn blank_student(base: BaseUser) -> User {
    base.into_student(String::new())
}

fn blank_operator(base: BaseUser) -> User {
    base.into_operator(String::new(), OperatorRole::Plain)
}

fn blank_company(base: BaseUser) -> User {
    base.into_company(String::new(), AgreementStatus::Inactive, time::Date::MIN)
}

fn blank_company_tutor(base: BaseUser) -> User {
    base.into_company_tutor(String::new(), 0, String::new())
}

fn blank_academic_tutor(base: BaseUser) -> User {
    base.into_academic_tutor(String::new())
}

pub static STUDENT: Binding = Binding {
    kind: Kind::Student,
    discriminator: "studente",
    table: "studenti",
    key: "studente_id",
    columns: &[
        column!("matricola", Student.enrollment_number, Text),
    ],
    blank: blank_student,
};

pub static OPERATOR: Binding = Binding {
    kind: Kind::Operator,
    discriminator: "operatore",
    table: "operatori_ufficio_tirocinio",
    key: "operatore_id",
    columns: &[
        column!("codice_fiscale", Operator.fiscal_code, Text),
        Column { name: "ruolo", ty: ColumnType::Text, get: get_role, set: set_role },
    ],
    blank: blank_operator,
};

pub static COMPANY: Binding = Binding {
    kind: Kind::Company,
    discriminator: "azienda",
    table: "aziende",
    key: "azienda_id",
    columns: &[
        column!("partita_iva", Company.vat_id, Text),
        column!("nome_rappresentante", Company.rep_name, Text),
        column!("cognome_rappresentante", Company.rep_surname, Text),
        Column {
            name: "stato_convenzione",
            ty: ColumnType::Text,
            get: get_agreement,
            set: set_agreement,
        },
        column!("rif_convenzione", Company.agreement_ref, Text),
        column!("data_convenzione", Company.agreement_date, Date),
        column!("indirizzo_sede_legale", Company.legal_address, Text),
        column!("citta_sede_legale", Company.legal_city, Text),
    ],
    blank: blank_company,
};

pub static COMPANY_TUTOR: Binding = Binding {
    kind: Kind::CompanyTutor,
    discriminator: "tutor_aziendale",
    table: "tutor_aziendali",
    key: "tutor_id",
    columns: &[
        column!("azienda_id", CompanyTutor.company_id, BigInt),
        column!("codice_fiscale", CompanyTutor.fiscal_code, Text),
        column!("telefono", CompanyTutor.phone, Text),
    ],
    blank: blank_company_tutor,
};

pub static ACADEMIC_TUTOR: Binding = Binding {
    kind: Kind::AcademicTutor,
    discriminator: "tutor_accademico",
    table: "tutor_accademici",
    key: "tutor_id",
    columns: &[
        column!("codice_fiscale", AcademicTutor.fiscal_code, Text),
    ],
    blank: blank_academic_tutor,
};

static STANDARD: &[&Binding] = &[
    &STUDENT, &OPERATOR, &COMPANY, &COMPANY_TUTOR, &ACADEMIC_TUTOR,
];

/// A set of bindings to resolve users against.
#[derive(Clone, Copy)]
pub struct Registry {
    bindings: &'static [&'static Binding],
}

impl Registry {
    pub const fn new(bindings: &'static [&'static Binding]) -> Self {
        Self { bindings }
    }

    /// Every kind of user.
    pub fn standard() -> Self { Self::new(STANDARD) }

    pub fn by_kind(&self, kind: Kind) -> Option<&'static Binding> {
        self.bindings.iter().find(|b| b.kind == kind).copied()
    }

    pub fn by_discriminator(&self, disc: &str) -> Option<&'static Binding> {
        self.bindings.iter().find(|b| b.discriminator == disc).copied()
    }
}

impl Default for Registry {
    fn default() -> Self { Self::standard() }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list()
            .entries(self.bindings.iter().map(|b| b.discriminator))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn every_kind_registered_once() {
        let reg = Registry::standard();
        for kind in [
            Kind::Student, Kind::Operator, Kind::Company,
            Kind::CompanyTutor, Kind::AcademicTutor,
        ] {
            let b = reg.by_kind(kind).unwrap();
            assert_eq!(b.kind, kind);
            assert_eq!(reg.by_discriminator(b.discriminator).unwrap().kind, kind);
        }
        assert!(reg.by_discriminator("amministratore").is_none());
    }

    #[test]
    fn restricted_registry() {
        static ONLY_STUDENTS: &[&Binding] = &[&STUDENT];
        let reg = Registry::new(ONLY_STUDENTS);
        assert!(reg.by_kind(Kind::Student).is_some());
        assert!(reg.by_kind(Kind::Company).is_none());
        assert!(reg.by_discriminator("azienda").is_none());
    }

    #[test]
    fn company_values_in_order() {
        let mut u = BaseUser::new("acme".into(), "info@acme.it".into())
            .into_company("01234567890".into(), AgreementStatus::Active, date!(2017 - 06 - 15));
        if let User::Company(c) = &mut u {
            c.rep_name = "Wile".into();
            c.rep_surname = "Coyote".into();
            c.agreement_ref = "CONV-2017-12".into();
            c.legal_address = "Via Roma 1".into();
            c.legal_city = "Salerno".into();
        }

        let vals = COMPANY.values(7, &u).unwrap();
        let names: Vec<&str> = vals.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec![
            "azienda_id", "partita_iva", "nome_rappresentante",
            "cognome_rappresentante", "stato_convenzione", "rif_convenzione",
            "data_convenzione", "indirizzo_sede_legale", "citta_sede_legale",
        ]);
        assert_eq!(vals[0].1, Value::BigInt(7));
        assert_eq!(vals[4].1, Value::Text("attiva".into()));
        assert_eq!(vals[6].1, Value::Date(date!(2017 - 06 - 15)));
    }

    #[test]
    fn values_reject_wrong_kind() {
        let u = BaseUser::new("x".into(), "x@x.it".into()).into_student("1".into());
        assert!(matches!(
            OPERATOR.values(1, &u),
            Err(DbError::UnsupportedVariant(Kind::Student))
        ));
    }

    #[test]
    fn setters_decode() {
        let mut u = blank_operator(BaseUser::default());
        for col in OPERATOR.columns.iter() {
            let v = match col.name {
                "ruolo" => Value::Text("nonsense".into()),
                _ => Value::Text("RSSMRA80A01H703X".into()),
            };
            (col.set)(&mut u, v).unwrap();
        }
        match &u {
            User::Operator(o) => {
                assert_eq!(o.role, OperatorRole::Plain);
                assert_eq!(o.fiscal_code, "RSSMRA80A01H703X");
            },
            _ => panic!("not an operator"),
        }

        let mut u = blank_company(BaseUser::default());
        let status = COMPANY.columns.iter().find(|c| c.name == "stato_convenzione").unwrap();
        assert!(matches!(
            (status.set)(&mut u, Value::Text("sospesa".into())),
            Err(DbError::DataIntegrity(_))
        ));
        (status.set)(&mut u, Value::Text("attiva".into())).unwrap();
        match &u {
            User::Company(c) => assert_eq!(c.agreement, AgreementStatus::Active),
            _ => panic!("not a company"),
        }
    }
}
