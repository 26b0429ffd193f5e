/*!
Database users.

Every user shares the fields in [`BaseUser`]; the [`User`] enum adds the
fields specific to each kind of user.
*/
use time::{Date, OffsetDateTime};

/// Explicit tag for each kind of [`User`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Student,
    Operator,
    Company,
    CompanyTutor,
    AcademicTutor,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let token = match self {
            Kind::Student       => "Student",
            Kind::Operator      => "Operator",
            Kind::Company       => "Company",
            Kind::CompanyTutor  => "CompanyTutor",
            Kind::AcademicTutor => "AcademicTutor",
        };

        write!(f, "{}", token)
    }
}

/// Position of an internship office operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorRole {
    Plain,
    DepartmentHead,
    BoardChair,
}

impl OperatorRole {
    /// Decode a stored role, falling back to `Plain` for anything
    /// unrecognized.
    pub fn decode_lenient(s: &str) -> OperatorRole {
        match s.parse() {
            Ok(r) => r,
            Err(e) => {
                log::debug!("{}; defaulting to {:?}.", &e, OperatorRole::Plain);
                OperatorRole::Plain
            },
        }
    }
}

impl std::fmt::Display for OperatorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let token = match self {
            OperatorRole::Plain          => "operatore",
            OperatorRole::DepartmentHead => "direttore_dip",
            OperatorRole::BoardChair     => "presidente_cons_did",
        };

        write!(f, "{}", token)
    }
}

impl std::str::FromStr for OperatorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "operatore"           => Ok(OperatorRole::Plain),
            "direttore_dip"       => Ok(OperatorRole::DepartmentHead),
            "presidente_cons_did" => Ok(OperatorRole::BoardChair),
            _ => Err(format!("{:?} is not a valid OperatorRole.", s)),
        }
    }
}

/// State of a company's internship agreement with the university.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgreementStatus {
    Active,
    Inactive,
}

impl std::fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let token = match self {
            AgreementStatus::Active   => "attiva",
            AgreementStatus::Inactive => "non_attiva",
        };

        write!(f, "{}", token)
    }
}

impl std::str::FromStr for AgreementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attiva"     => Ok(AgreementStatus::Active),
            "non_attiva" => Ok(AgreementStatus::Inactive),
            _ => Err(format!("{:?} is not a valid AgreementStatus.", s)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BaseUser {
    /// `None` until the user has been saved.
    pub id: Option<i64>,
    /// Set by the database when the user is saved.
    pub enrolled: Option<OffsetDateTime>,
    pub login: String,
    /// Credential hash; never the plaintext.
    pub password: String,
    pub email: String,
    pub name: String,
    pub surname: String,
}

impl BaseUser {
    pub fn new(login: String, email: String) -> Self {
        Self { login, email, ..Self::default() }
    }

    pub fn with_names(mut self, name: String, surname: String) -> Self {
        self.name = name;
        self.surname = surname;
        self
    }

    pub fn with_password(mut self, password: String) -> Self {
        self.password = password;
        self
    }

    pub fn into_student(self, enrollment_number: String) -> User {
        User::Student(Student { base: self, enrollment_number })
    }

    pub fn into_operator(self, fiscal_code: String, role: OperatorRole) -> User {
        User::Operator(Operator { base: self, fiscal_code, role })
    }

    /// Legal representative, agreement reference and legal seat start out
    /// blank; set them on the returned `Company`.
    pub fn into_company(
        self,
        vat_id: String,
        agreement: AgreementStatus,
        agreement_date: Date,
    ) -> User {
        let c = Company {
            base: self,
            vat_id,
            rep_name: String::new(),
            rep_surname: String::new(),
            agreement,
            agreement_ref: String::new(),
            agreement_date,
            legal_address: String::new(),
            legal_city: String::new(),
        };
        User::Company(c)
    }

    pub fn into_company_tutor(
        self,
        fiscal_code: String,
        company_id: i64,
        phone: String,
    ) -> User {
        User::CompanyTutor(CompanyTutor { base: self, fiscal_code, company_id, phone })
    }

    pub fn into_academic_tutor(self, fiscal_code: String) -> User {
        User::AcademicTutor(AcademicTutor { base: self, fiscal_code })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Student {
    pub base: BaseUser,
    /// University enrollment number ("matricola").
    pub enrollment_number: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Operator {
    pub base: BaseUser,
    pub fiscal_code: String,
    pub role: OperatorRole,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Company {
    pub base: BaseUser,
    pub vat_id: String,
    /// Legal representative's first name.
    pub rep_name: String,
    pub rep_surname: String,
    pub agreement: AgreementStatus,
    /// The university's internal reference for the agreement.
    pub agreement_ref: String,
    pub agreement_date: Date,
    pub legal_address: String,
    pub legal_city: String,
}

impl Company {
    /// Set the agreement date from a Unix timestamp (seconds, UTC).
    pub fn set_agreement_timestamp(&mut self, ts: i64) -> Result<(), String> {
        let t = OffsetDateTime::from_unix_timestamp(ts)
            .map_err(|e| format!("{} is not a valid timestamp: {}", ts, &e))?;
        self.agreement_date = t.date();
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompanyTutor {
    pub base: BaseUser,
    pub fiscal_code: String,
    /// `id` of the `Company` this tutor works for; it must already be saved.
    pub company_id: i64,
    pub phone: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AcademicTutor {
    pub base: BaseUser,
    pub fiscal_code: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum User {
    Student(Student),
    Operator(Operator),
    Company(Company),
    CompanyTutor(CompanyTutor),
    AcademicTutor(AcademicTutor),
}

impl User {
    pub fn kind(&self) -> Kind {
        match self {
            User::Student(_)       => Kind::Student,
            User::Operator(_)      => Kind::Operator,
            User::Company(_)       => Kind::Company,
            User::CompanyTutor(_)  => Kind::CompanyTutor,
            User::AcademicTutor(_) => Kind::AcademicTutor,
        }
    }

    pub fn base(&self) -> &BaseUser {
        match self {
            User::Student(s)       => &s.base,
            User::Operator(o)      => &o.base,
            User::Company(c)       => &c.base,
            User::CompanyTutor(t)  => &t.base,
            User::AcademicTutor(t) => &t.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseUser {
        match self {
            User::Student(s)       => &mut s.base,
            User::Operator(o)      => &mut o.base,
            User::Company(c)       => &mut c.base,
            User::CompanyTutor(t)  => &mut t.base,
            User::AcademicTutor(t) => &mut t.base,
        }
    }

    pub fn id(&self) -> Option<i64> { self.base().id }

    pub fn login(&self) -> &str { &self.base().login }

    pub fn email(&self) -> &str { &self.base().email }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn role_strings() {
        for r in [OperatorRole::Plain, OperatorRole::DepartmentHead, OperatorRole::BoardChair] {
            let s = r.to_string();
            assert_eq!(s.parse::<OperatorRole>().unwrap(), r);
        }
        assert!("capo".parse::<OperatorRole>().is_err());
        assert_eq!(OperatorRole::decode_lenient("capo"), OperatorRole::Plain);
        assert_eq!(
            OperatorRole::decode_lenient("presidente_cons_did"),
            OperatorRole::BoardChair
        );
    }

    #[test]
    fn agreement_strings() {
        assert_eq!("attiva".parse::<AgreementStatus>().unwrap(), AgreementStatus::Active);
        assert_eq!("non_attiva".parse::<AgreementStatus>().unwrap(), AgreementStatus::Inactive);
        assert_eq!(AgreementStatus::Inactive.to_string(), "non_attiva");
        assert!("sospesa".parse::<AgreementStatus>().is_err());
    }

    #[test]
    fn construction() {
        let u = BaseUser::new("mrossi".into(), "m.rossi@unisa.it".into())
            .with_names("Mario".into(), "Rossi".into())
            .into_student("0512100001".into());
        assert_eq!(u.kind(), Kind::Student);
        assert_eq!(u.id(), None);
        assert_eq!(u.login(), "mrossi");
        assert_eq!(u.base().surname, "Rossi");
    }

    #[test]
    fn agreement_timestamp() {
        let mut u = BaseUser::new("acme".into(), "info@acme.it".into())
            .into_company("01234567890".into(), AgreementStatus::Active, date!(2000 - 01 - 01));
        if let User::Company(c) = &mut u {
            // 2017-06-15 13:20:00 UTC
            c.set_agreement_timestamp(1_497_532_800).unwrap();
            assert_eq!(c.agreement_date, date!(2017 - 06 - 15));
            assert!(c.set_agreement_timestamp(i64::MAX).is_err());
        } else {
            panic!("not a company");
        }
    }
}
