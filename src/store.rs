//! Defines the data gateway between the scheduler core and the persistence layer.
//!
//! The scheduler never holds long-lived references into the store. At the start of a run it
//! reads a snapshot (the unscheduled pool, the group histories, and the roster) through the
//! [TimetableStore] trait, and at the end it writes the single winning timetable back in one
//! transaction. Everything in between happens on plain values.

#[cfg(test)]
mod test;

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Row, params, types::Type};
use rusqlite_migration::{M, Migrations};

use crate::{
    data::{
        Group, GroupId, GroupStats, Lesson, LessonId, Link, NO_HISTORY_LOOKBACK_DAYS, NewLesson,
        Subject, SubjectId, User, UserId, UserType, midnight,
    },
    db_utils,
    error::ScheduleError,
};

/// An interface to read the data a scheduling run needs and to write its results back.
pub trait TimetableStore: Send + Sync {
    /// Adds a user and returns its ID.
    fn add_user(
        &mut self,
        user_type: UserType,
        title: Option<&str>,
        first_name: &str,
        last_name: &str,
        year_group: Option<&str>,
    ) -> Result<UserId, ScheduleError>;

    /// Adds a subject and returns its ID.
    fn add_subject(&mut self, name: &str, abbreviation: &str) -> Result<SubjectId, ScheduleError>;

    /// Adds a group and returns its ID.
    fn add_group(&mut self, name: &str) -> Result<GroupId, ScheduleError>;

    /// Links a user to a group with a subject context and returns the link's ID.
    fn add_link(
        &mut self,
        user_id: UserId,
        group_id: GroupId,
        subject_id: SubjectId,
    ) -> Result<i64, ScheduleError>;

    /// Adds a single lesson and returns its ID.
    fn add_lesson(&mut self, lesson: &NewLesson) -> Result<LessonId, ScheduleError>;

    /// Adds all the given lessons in a single transaction. Either every row is written or none
    /// is.
    fn add_lessons(&mut self, lessons: &[NewLesson]) -> Result<(), ScheduleError>;

    /// Returns the lessons eligible for scheduling: not fixed, and either never scheduled or
    /// scheduled past `first_day`. At most `per_group_cap` lessons per group are returned,
    /// first seen (lowest ID) first.
    fn unscheduled_lessons(
        &self,
        first_day: DateTime<Utc>,
        per_group_cap: usize,
    ) -> Result<Vec<Lesson>, ScheduleError>;

    /// Returns all the lessons whose start lies in `[start, end)`, ordered by start.
    fn lessons_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, ScheduleError>;

    /// Returns whether any lesson starts in `[start, end)`. The driver uses this to skip days
    /// that already have a timetable.
    fn has_lesson_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, ScheduleError>;

    /// Returns the scheduling history of every group: the total seconds of lessons received up
    /// to `now` and the whole days since the group's most recent lesson. Groups with no history
    /// report zero seconds and [NO_HISTORY_LOOKBACK_DAYS].
    fn group_statistics(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<GroupId, GroupStats>, ScheduleError>;

    /// Returns the students linked to the given group, ordered by ID.
    fn students_of_group(&self, group_id: GroupId) -> Result<Vec<User>, ScheduleError>;

    /// Returns the teacher of the given group: the first user of type teacher linked to it, by
    /// ID. Returns `None` for a group with no teacher, which disqualifies the group from
    /// scheduling.
    fn teacher_of_group(&self, group_id: GroupId) -> Result<Option<User>, ScheduleError>;

    /// Returns every user linked to the given group, ordered by ID. These are the participants
    /// of the group's lessons.
    fn users_of_group(&self, group_id: GroupId) -> Result<Vec<User>, ScheduleError>;

    /// Returns the reference point for term-progress weighting: the start of the
    /// earliest-starting lesson, or the most recent 1 September before (or equal to) `now`.
    fn year_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError>;

    /// Returns every group, ordered by ID.
    fn groups(&self) -> Result<Vec<Group>, ScheduleError>;

    /// Returns every subject, ordered by ID.
    fn subjects(&self) -> Result<Vec<Subject>, ScheduleError>;

    /// Returns the links of the given group, ordered by ID. These carry the subject context of
    /// each membership.
    fn links_of_group(&self, group_id: GroupId) -> Result<Vec<Link>, ScheduleError>;
}

/// An implementation of [TimetableStore] backed by SQLite.
pub struct TimetableStoreDB {
    /// A pool of connections to the database.
    pool: Pool<SqliteConnectionManager>,
}

impl TimetableStoreDB {
    /// Returns all the migrations needed to set up the database.
    fn migrations() -> Migrations<'static> {
        Migrations::new(vec![
            M::up(
                "CREATE TABLE users(
                    id INTEGER PRIMARY KEY,
                    user_type TEXT NOT NULL,
                    title TEXT,
                    first_name TEXT NOT NULL,
                    last_name TEXT NOT NULL,
                    year_group TEXT);",
            )
            .down("DROP TABLE users"),
            M::up(
                "CREATE TABLE subjects(
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    abbreviation TEXT NOT NULL);",
            )
            .down("DROP TABLE subjects"),
            M::up("CREATE TABLE groups(id INTEGER PRIMARY KEY, name TEXT NOT NULL);")
                .down("DROP TABLE groups"),
            M::up(
                "CREATE TABLE links(
                    id INTEGER PRIMARY KEY,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    subject_id INTEGER NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
                    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE);",
            )
            .down("DROP TABLE links"),
            M::up(
                "CREATE TABLE lessons(
                    id INTEGER PRIMARY KEY,
                    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                    duration INTEGER NOT NULL,
                    topic TEXT NOT NULL,
                    start INTEGER,
                    fixed INTEGER NOT NULL DEFAULT 0);",
            )
            .down("DROP TABLE lessons"),
            M::up("CREATE INDEX lesson_starts ON lessons (start);").down("DROP INDEX lesson_starts"),
            M::up("CREATE INDEX link_groups ON links (group_id);").down("DROP INDEX link_groups"),
        ])
    }

    /// Initializes the database by running the migrations. If the migrations have been applied
    /// already, they will have no effect on the database.
    fn init(&mut self) -> Result<()> {
        let mut connection = self.pool.get()?;
        let migrations = Self::migrations();
        migrations
            .to_latest(&mut connection)
            .with_context(|| "failed to initialize timetable store")?;
        Ok(())
    }

    /// A constructor taking a connection manager.
    pub fn new(connection_manager: SqliteConnectionManager) -> Result<TimetableStoreDB> {
        let pool = Pool::new(connection_manager)?;
        let mut store = TimetableStoreDB { pool };
        store.init()?;
        Ok(store)
    }

    /// A constructor taking the path to the database file.
    pub fn new_from_disk(db_path: &str) -> Result<TimetableStoreDB> {
        Self::new(db_utils::new_connection_manager(db_path))
    }

    /// A constructor for an in-memory store, used by the tests and development servers.
    pub fn new_in_memory() -> Result<TimetableStoreDB> {
        // A single connection so that every pooled handle sees the same in-memory database.
        let pool = Pool::builder()
            .max_size(1)
            .build(db_utils::new_in_memory_connection_manager())?;
        let mut store = TimetableStoreDB { pool };
        store.init()?;
        Ok(store)
    }

    /// Converts a row of the users table into a [User].
    fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
        let type_text: String = row.get(1)?;
        let user_type = type_text
            .parse::<UserType>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
        Ok(User {
            id: row.get(0)?,
            user_type,
            title: row.get(2)?,
            first_name: row.get(3)?,
            last_name: row.get(4)?,
            year_group: row.get(5)?,
        })
    }

    /// Converts a row of the lessons table into a [Lesson].
    fn row_to_lesson(row: &Row<'_>) -> rusqlite::Result<Lesson> {
        let start_secs: Option<i64> = row.get(4)?;
        let start = match start_secs {
            None => None,
            Some(secs) => Some(DateTime::from_timestamp(secs, 0).ok_or(
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    Type::Integer,
                    format!("lesson start {secs} is out of range").into(),
                ),
            )?),
        };
        Ok(Lesson {
            id: row.get(0)?,
            group_id: row.get(1)?,
            duration: TimeDelta::seconds(row.get(2)?),
            topic: row.get(3)?,
            start,
            fixed: row.get(5)?,
        })
    }

    /// Helper function to add a lesson using an existing connection.
    fn add_lesson_helper(connection: &rusqlite::Connection, lesson: &NewLesson) -> Result<LessonId> {
        let mut stmt = connection.prepare_cached(
            "INSERT INTO lessons (group_id, duration, topic, start, fixed)
                VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        stmt.execute(params![
            lesson.group_id,
            lesson.duration.num_seconds(),
            lesson.topic,
            lesson.start.map(|s| s.timestamp()),
            lesson.fixed,
        ])?;
        Ok(connection.last_insert_rowid())
    }

    /// Helper function to query the lessons eligible for scheduling.
    fn unscheduled_lessons_helper(
        &self,
        first_day: DateTime<Utc>,
        per_group_cap: usize,
    ) -> Result<Vec<Lesson>> {
        let connection = self.pool.get()?;
        let mut stmt = connection.prepare_cached(
            "SELECT id, group_id, duration, topic, start, fixed FROM lessons
                WHERE fixed = 0 AND (start IS NULL OR start > ?1) ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![first_day.timestamp()], Self::row_to_lesson)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| "cannot query unscheduled lessons")?;

        // Cap the number of lessons per group, first seen wins.
        let mut per_group: BTreeMap<GroupId, usize> = BTreeMap::new();
        let mut capped = Vec::with_capacity(rows.len());
        for lesson in rows {
            let count = per_group.entry(lesson.group_id).or_insert(0);
            if *count < per_group_cap {
                *count += 1;
                capped.push(lesson);
            }
        }
        Ok(capped)
    }

    /// Helper function to query the lessons starting within a half-open interval.
    fn lessons_between_helper(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Lesson>> {
        let connection = self.pool.get()?;
        let mut stmt = connection.prepare_cached(
            "SELECT id, group_id, duration, topic, start, fixed FROM lessons
                WHERE start IS NOT NULL AND start >= ?1 AND start < ?2 ORDER BY start",
        )?;
        let rows = stmt
            .query_map(
                params![start.timestamp(), end.timestamp()],
                Self::row_to_lesson,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| "cannot query lessons by start")?;
        Ok(rows)
    }

    /// Helper function to accumulate the scheduling history of every group.
    fn group_statistics_helper(&self, now: DateTime<Utc>) -> Result<BTreeMap<GroupId, GroupStats>> {
        let connection = self.pool.get()?;

        // Walk every past lesson in chronological order, accumulating the total seconds and
        // the most recent start per group.
        let mut stmt = connection.prepare_cached(
            "SELECT group_id, duration, start FROM lessons
                WHERE start IS NOT NULL AND start <= ?1 ORDER BY start",
        )?;
        let rows = stmt
            .query_map(params![now.timestamp()], |row| {
                Ok((
                    row.get::<_, GroupId>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| "cannot query group history")?;

        let mut totals: BTreeMap<GroupId, (i64, i64)> = BTreeMap::new();
        for (group_id, duration, start) in rows {
            let entry = totals.entry(group_id).or_insert((0, start));
            entry.0 += duration;
            entry.1 = start;
        }

        // Every group appears in the result, with or without history.
        let mut stmt = connection.prepare_cached("SELECT id FROM groups")?;
        let group_ids = stmt
            .query_map(params![], |row| row.get::<_, GroupId>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| "cannot query groups")?;

        let today = midnight(now);
        let mut stats = BTreeMap::new();
        for group_id in group_ids {
            let entry = match totals.get(&group_id) {
                None => GroupStats {
                    allocated_secs: 0,
                    days_since_last: NO_HISTORY_LOOKBACK_DAYS,
                },
                Some((allocated_secs, last_start)) => {
                    let last = DateTime::from_timestamp(*last_start, 0)
                        .ok_or_else(|| anyhow!("lesson start {last_start} is out of range"))?;
                    GroupStats {
                        allocated_secs: *allocated_secs,
                        days_since_last: (today - midnight(last)).num_days(),
                    }
                }
            };
            stats.insert(group_id, entry);
        }
        Ok(stats)
    }

    /// Helper function to query the users linked to a group, optionally restricted to one user
    /// type.
    fn group_users_helper(&self, group_id: GroupId, user_type: Option<UserType>) -> Result<Vec<User>> {
        let connection = self.pool.get()?;
        let mut stmt = connection.prepare_cached(
            "SELECT DISTINCT u.id, u.user_type, u.title, u.first_name, u.last_name, u.year_group
                FROM users u JOIN links l ON l.user_id = u.id
                WHERE l.group_id = ?1 AND (?2 IS NULL OR u.user_type = ?2)
                ORDER BY u.id",
        )?;
        let users = stmt
            .query_map(
                params![group_id, user_type.map(|t| t.to_string())],
                Self::row_to_user,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("cannot query users of group with ID {group_id}"))?;
        Ok(users)
    }
}

impl TimetableStore for TimetableStoreDB {
    fn add_user(
        &mut self,
        user_type: UserType,
        title: Option<&str>,
        first_name: &str,
        last_name: &str,
        year_group: Option<&str>,
    ) -> Result<UserId, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        connection
            .execute(
                "INSERT INTO users (user_type, title, first_name, last_name, year_group)
                    VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_type.to_string(), title, first_name, last_name, year_group],
            )
            .map_err(|e| ScheduleError::Store(e.into()))?;
        Ok(connection.last_insert_rowid())
    }

    fn add_subject(&mut self, name: &str, abbreviation: &str) -> Result<SubjectId, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        connection
            .execute(
                "INSERT INTO subjects (name, abbreviation) VALUES (?1, ?2)",
                params![name, abbreviation],
            )
            .map_err(|e| ScheduleError::Store(e.into()))?;
        Ok(connection.last_insert_rowid())
    }

    fn add_group(&mut self, name: &str) -> Result<GroupId, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        connection
            .execute("INSERT INTO groups (name) VALUES (?1)", params![name])
            .map_err(|e| ScheduleError::Store(e.into()))?;
        Ok(connection.last_insert_rowid())
    }

    fn add_link(
        &mut self,
        user_id: UserId,
        group_id: GroupId,
        subject_id: SubjectId,
    ) -> Result<i64, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        connection
            .execute(
                "INSERT INTO links (user_id, subject_id, group_id) VALUES (?1, ?2, ?3)",
                params![user_id, subject_id, group_id],
            )
            .map_err(|e| ScheduleError::Store(e.into()))?;
        Ok(connection.last_insert_rowid())
    }

    fn add_lesson(&mut self, lesson: &NewLesson) -> Result<LessonId, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        Self::add_lesson_helper(&connection, lesson).map_err(ScheduleError::Store)
    }

    fn add_lessons(&mut self, lessons: &[NewLesson]) -> Result<(), ScheduleError> {
        let mut connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        let tx = connection
            .transaction()
            .map_err(|e| ScheduleError::Store(e.into()))?;
        for lesson in lessons {
            Self::add_lesson_helper(&tx, lesson).map_err(ScheduleError::Store)?;
        }
        tx.commit().map_err(|e| ScheduleError::Store(e.into()))
    }

    fn unscheduled_lessons(
        &self,
        first_day: DateTime<Utc>,
        per_group_cap: usize,
    ) -> Result<Vec<Lesson>, ScheduleError> {
        self.unscheduled_lessons_helper(first_day, per_group_cap)
            .map_err(ScheduleError::Store)
    }

    fn lessons_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, ScheduleError> {
        self.lessons_between_helper(start, end)
            .map_err(ScheduleError::Store)
    }

    fn has_lesson_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        let exists = connection
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM lessons WHERE start IS NOT NULL AND start >= ?1 AND start < ?2)",
                params![start.timestamp(), end.timestamp()],
                |row| row.get::<_, bool>(0),
            )
            .map_err(|e| ScheduleError::Store(e.into()))?;
        Ok(exists)
    }

    fn group_statistics(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<GroupId, GroupStats>, ScheduleError> {
        self.group_statistics_helper(now).map_err(ScheduleError::Store)
    }

    fn students_of_group(&self, group_id: GroupId) -> Result<Vec<User>, ScheduleError> {
        self.group_users_helper(group_id, Some(UserType::Student))
            .map_err(ScheduleError::Store)
    }

    fn teacher_of_group(&self, group_id: GroupId) -> Result<Option<User>, ScheduleError> {
        let teachers = self
            .group_users_helper(group_id, Some(UserType::Teacher))
            .map_err(ScheduleError::Store)?;
        Ok(teachers.into_iter().next())
    }

    fn users_of_group(&self, group_id: GroupId) -> Result<Vec<User>, ScheduleError> {
        self.group_users_helper(group_id, None)
            .map_err(ScheduleError::Store)
    }

    fn groups(&self) -> Result<Vec<Group>, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        let mut stmt = connection
            .prepare_cached("SELECT id, name FROM groups ORDER BY id")
            .map_err(|e| ScheduleError::Store(e.into()))?;
        let groups = stmt
            .query_map(params![], |row| {
                Ok(Group {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .map_err(|e| ScheduleError::Store(e.into()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ScheduleError::Store(e.into()))?;
        Ok(groups)
    }

    fn subjects(&self) -> Result<Vec<Subject>, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        let mut stmt = connection
            .prepare_cached("SELECT id, name, abbreviation FROM subjects ORDER BY id")
            .map_err(|e| ScheduleError::Store(e.into()))?;
        let subjects = stmt
            .query_map(params![], |row| {
                Ok(Subject {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    abbreviation: row.get(2)?,
                })
            })
            .map_err(|e| ScheduleError::Store(e.into()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ScheduleError::Store(e.into()))?;
        Ok(subjects)
    }

    fn links_of_group(&self, group_id: GroupId) -> Result<Vec<Link>, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        let mut stmt = connection
            .prepare_cached(
                "SELECT id, user_id, group_id, subject_id FROM links
                    WHERE group_id = ?1 ORDER BY id",
            )
            .map_err(|e| ScheduleError::Store(e.into()))?;
        let links = stmt
            .query_map(params![group_id], |row| {
                Ok(Link {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    group_id: row.get(2)?,
                    subject_id: row.get(3)?,
                })
            })
            .map_err(|e| ScheduleError::Store(e.into()))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ScheduleError::Store(e.into()))?;
        Ok(links)
    }

    fn year_start(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let connection = self.pool.get().map_err(|e| ScheduleError::Store(e.into()))?;
        let earliest: Option<i64> = connection
            .query_row(
                "SELECT MIN(start) FROM lessons WHERE start IS NOT NULL",
                params![],
                |row| row.get(0),
            )
            .map_err(|e| ScheduleError::Store(e.into()))?;

        if let Some(secs) = earliest {
            return DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| ScheduleError::Store(anyhow!("lesson start {secs} is out of range")));
        }

        // With no scheduled lessons at all, fall back to the most recent 1 September.
        let date = now.date_naive();
        let year = if date.month() >= 9 { date.year() } else { date.year() - 1 };
        let september = NaiveDate::from_ymd_opt(year, 9, 1)
            .ok_or_else(|| ScheduleError::Store(anyhow!("cannot construct 1 September of {year}")))?;
        Ok(september.and_time(NaiveTime::MIN).and_utc())
    }
}
